//! Deterministic mapping from remote URLs to files under the output root.
//!
//! Every component that needs to know where a URL lives on disk goes through
//! [`PathMapper::local_path`]. The mapping is a pure function of the URL and
//! the mapper configuration, which is what makes the "already on disk, skip
//! the request" short-circuit and relative-path computation between two
//! rewrite passes agree with each other.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use url::Url;

use crate::url_filter::authority;

/// File name used for directory-style URLs (`/`, `/docs/`, `/docs`).
pub const INDEX_FILE: &str = "index.html";

/// Subtree holding other domains' resources in [`Layout::OriginRooted`].
pub const EXTERNAL_DIR: &str = "_external";

const UNKNOWN_BUCKET: &str = "unknown";
const FALLBACK_FILE: &str = "error.html";

/// How resources from different hosts are bucketed under the output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// `<root>/<host>/<path>` for every host, the origin included.
    PerHost,
    /// `<root>/<path>` for the origin, `<root>/_external/<host>/<path>` for
    /// everything else.
    OriginRooted,
}

#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
    origin: Option<String>,
    layout: Layout,
}

impl PathMapper {
    pub fn new(root: impl Into<PathBuf>, origin: &Url, layout: Layout) -> Self {
        Self {
            root: root.into(),
            origin: authority(origin).map(|host| sanitize_segment(&host)),
            layout,
        }
    }

    /// Maps a URL string; anything that fails to parse lands on the sentinel
    /// path instead of erroring.
    pub fn local_path(&self, url: &str) -> PathBuf {
        match Url::parse(url) {
            Ok(parsed) => self.local_path_for(&parsed),
            Err(_) => self.fallback_path(),
        }
    }

    pub fn local_path_for(&self, url: &Url) -> PathBuf {
        let host = match authority(url) {
            Some(host) => sanitize_segment(&host),
            None => return self.fallback_path(),
        };

        let in_root =
            self.layout == Layout::OriginRooted && self.origin.as_deref() == Some(host.as_str());
        let mut path = self.bucket_dir(&host);
        for (index, segment) in file_segments(url).into_iter().enumerate() {
            if index == 0 && in_root {
                path.push(unreserve(segment, EXTERNAL_DIR));
            } else {
                path.push(segment);
            }
        }
        path
    }

    /// Sentinel for URLs that cannot be mapped.
    pub fn fallback_path(&self) -> PathBuf {
        self.root
            .join(EXTERNAL_DIR)
            .join(UNKNOWN_BUCKET)
            .join(FALLBACK_FILE)
    }

    fn bucket_dir(&self, host: &str) -> PathBuf {
        match self.layout {
            Layout::PerHost => self.root.join(unreserve(host.to_string(), EXTERNAL_DIR)),
            Layout::OriginRooted if self.origin.as_deref() == Some(host) => self.root.clone(),
            Layout::OriginRooted => self
                .root
                .join(EXTERNAL_DIR)
                .join(unreserve(host.to_string(), UNKNOWN_BUCKET)),
        }
    }
}

/// Path of `target` relative to the directory containing `document`, with
/// `/` separators on every platform so it can be dropped into markup.
pub fn relative_reference(document: &Path, target: &Path) -> String {
    let base = document.parent().unwrap_or_else(|| Path::new(""));
    let relative = pathdiff::diff_paths(target, base).unwrap_or_else(|| target.to_path_buf());

    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
        // Local names keep the URL's percent escapes literally; a browser
        // would decode them again when following the reference.
        .replace('%', "%25")
}

fn file_segments(url: &Url) -> Vec<String> {
    let mut segments: Vec<String> = url
        .path_segments()
        .map(|parts| {
            parts
                .filter(|part| !part.is_empty())
                .map(sanitize_segment)
                .collect()
        })
        .unwrap_or_default();

    let names_directory = url.path().ends_with('/')
        || segments.last().map_or(true, |last| !has_known_extension(last));
    if names_directory {
        segments.push(INDEX_FILE.to_string());
    }

    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        if let Some(last) = segments.last_mut() {
            *last = fold_query(last, query);
        }
    }

    segments
}

/// Extensions that make a final path segment a file. Anything else
/// (`/v1.0`, `/users/john.doe`) is a directory index, so that the segment
/// can still hold children.
const FILE_EXTENSIONS: &[&str] = &[
    "html", "htm", "xhtml", "shtml", "php", "asp", "aspx", "jsp", "cgi",
    "css", "js", "mjs", "cjs", "map", "json", "jsonld", "xml", "rss", "atom",
    "txt", "csv", "md", "pdf", "wasm", "webmanifest",
    "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "bmp", "tif", "tiff",
    "woff", "woff2", "ttf", "otf", "eot",
    "mp3", "mp4", "m4a", "ogg", "oga", "ogv", "wav", "webm", "mov", "flac",
    "zip", "gz", "tgz", "bz2", "xz", "7z", "tar", "rar",
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "epub",
];

fn has_known_extension(file_name: &str) -> bool {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => FILE_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// `app.js` + `v=2&x=1` -> `app%3Fv=2%26x=1.js`
///
/// The marker is the escape of `?`, which a parsed path segment never
/// carries raw, and `%` itself is always escaped, so the name decodes back
/// to exactly one (file, query) pair.
fn fold_query(file_name: &str, query: &str) -> String {
    let safe = escape_name(query, &['&']);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{}{}{}.{}", stem, QUERY_MARKER, safe, ext)
        }
        _ => format!("{}{}{}", file_name, QUERY_MARKER, safe),
    }
}

const QUERY_MARKER: &str = "%3F";

fn sanitize_segment(segment: &str) -> String {
    match segment {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => escape_name(segment, &[]),
    }
}

/// Percent-escapes `%`, separators, filesystem-reserved and control
/// characters (plus `extra`). Every other character passes through.
fn escape_name(name: &str, extra: &[char]) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        let reserved = matches!(
            c,
            '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
        ) || c.is_control()
            || extra.contains(&c);
        if reserved {
            push_escaped(&mut escaped, c);
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Keeps a name from landing on one of the mapper's own directories by
/// escaping its first character.
fn unreserve(name: String, reserved: &str) -> String {
    if name != reserved {
        return name;
    }
    let mut chars = name.chars();
    let mut escaped = String::with_capacity(name.len() + 2);
    if let Some(first) = chars.next() {
        push_escaped(&mut escaped, first);
    }
    escaped.push_str(chars.as_str());
    escaped
}

fn push_escaped(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    for byte in c.encode_utf8(&mut buf).bytes() {
        out.push_str(&format!("%{:02X}", byte));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(layout: Layout) -> PathMapper {
        PathMapper::new("/out", &Url::parse("https://example.com/").unwrap(), layout)
    }

    #[test]
    fn test_root_and_trailing_slash_map_to_index() {
        let m = mapper(Layout::PerHost);
        assert_eq!(m.local_path("https://example.com"), PathBuf::from("/out/example.com/index.html"));
        assert_eq!(m.local_path("https://example.com/"), PathBuf::from("/out/example.com/index.html"));
        assert_eq!(
            m.local_path("https://example.com/docs/"),
            PathBuf::from("/out/example.com/docs/index.html")
        );
    }

    #[test]
    fn test_extensionless_segment_is_a_directory_index() {
        let m = mapper(Layout::PerHost);
        assert_eq!(m.local_path("https://example.com/a"), PathBuf::from("/out/example.com/a/index.html"));
        assert_eq!(
            m.local_path("https://example.com/a/b.html"),
            PathBuf::from("/out/example.com/a/b.html")
        );
    }

    #[test]
    fn test_query_variants_map_to_distinct_files() {
        let m = mapper(Layout::PerHost);
        let plain = m.local_path("https://example.com/app.js");
        let v1 = m.local_path("https://example.com/app.js?v=1");
        let v2 = m.local_path("https://example.com/app.js?v=2&min=true");

        assert_eq!(plain, PathBuf::from("/out/example.com/app.js"));
        assert_eq!(v1, PathBuf::from("/out/example.com/app%3Fv=1.js"));
        assert_eq!(v2, PathBuf::from("/out/example.com/app%3Fv=2%26min=true.js"));
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_distinct_urls_never_share_a_file() {
        let pairs = [
            ("https://example.com/app.js?v=2", "https://example.com/app_v-2.js"),
            ("https://example.com/app.js?v=2", "https://example.com/app.js?v-2"),
            ("https://example.com/app.js?a=1&b=2", "https://example.com/app.js?a=1%26b=2"),
            ("https://example.com/app.js?v=2", "https://example.com/app%3Fv=2.js"),
            ("https://example.com/a:b.css", "https://example.com/a_b.css"),
            ("https://example.com/a:b.css", "https://example.com/a%3Ab.css"),
            ("http://localhost:8080/x.css", "http://localhost_8080/x.css"),
        ];
        for layout in [Layout::PerHost, Layout::OriginRooted] {
            let m = mapper(layout);
            for (left, right) in pairs {
                assert_ne!(m.local_path(left), m.local_path(right), "{} vs {}", left, right);
            }
        }
    }

    #[test]
    fn test_origin_paths_stay_out_of_the_external_tree() {
        let m = mapper(Layout::OriginRooted);
        let own = m.local_path("https://example.com/_external/cdn.example.com/lib.js");
        let external = m.local_path("https://cdn.example.com/lib.js");

        assert_eq!(own, PathBuf::from("/out/%5Fexternal/cdn.example.com/lib.js"));
        assert_ne!(own, external);
        assert_ne!(m.local_path("https://example.com/_external/unknown/error.html"), m.fallback_path());
        assert_ne!(m.local_path("http://unknown/error.html"), m.fallback_path());
    }

    #[test]
    fn test_per_host_bucket_never_shadows_the_sentinel() {
        let m = mapper(Layout::PerHost);
        assert_ne!(m.local_path("http://_external/unknown/error.html"), m.fallback_path());
    }

    #[test]
    fn test_dotted_segment_without_file_extension_is_a_directory() {
        let m = mapper(Layout::PerHost);
        assert_eq!(
            m.local_path("https://example.com/v1.0"),
            PathBuf::from("/out/example.com/v1.0/index.html")
        );
        assert_eq!(
            m.local_path("https://example.com/v1.0/notes"),
            PathBuf::from("/out/example.com/v1.0/notes/index.html")
        );
        assert_eq!(
            m.local_path("https://example.com/users/john.doe"),
            PathBuf::from("/out/example.com/users/john.doe/index.html")
        );
        assert_eq!(
            m.local_path("https://example.com/fonts/Inter.WOFF2"),
            PathBuf::from("/out/example.com/fonts/Inter.WOFF2")
        );
    }

    #[test]
    fn test_query_on_directory_url() {
        let m = mapper(Layout::PerHost);
        assert_eq!(
            m.local_path("https://example.com/search?q=rust"),
            PathBuf::from("/out/example.com/search/index%3Fq=rust.html")
        );
    }

    #[test]
    fn test_fragment_does_not_affect_path() {
        let m = mapper(Layout::PerHost);
        assert_eq!(
            m.local_path("https://example.com/page.html#top"),
            m.local_path("https://example.com/page.html")
        );
    }

    #[test]
    fn test_host_port_is_sanitized() {
        let m = mapper(Layout::PerHost);
        assert_eq!(
            m.local_path("http://localhost:8080/x.css"),
            PathBuf::from("/out/localhost%3A8080/x.css")
        );
    }

    #[test]
    fn test_per_host_layout_separates_domains() {
        let m = mapper(Layout::PerHost);
        assert_eq!(
            m.local_path("https://cdn.example.com/lib.js"),
            PathBuf::from("/out/cdn.example.com/lib.js")
        );
        assert_ne!(
            m.local_path("https://cdn.example.com/lib.js"),
            m.local_path("https://example.com/lib.js")
        );
    }

    #[test]
    fn test_origin_rooted_layout() {
        let m = mapper(Layout::OriginRooted);
        assert_eq!(m.local_path("https://example.com/css/a.css"), PathBuf::from("/out/css/a.css"));
        assert_eq!(
            m.local_path("https://cdn.example.com/lib.js"),
            PathBuf::from("/out/_external/cdn.example.com/lib.js")
        );
    }

    #[test]
    fn test_unparseable_url_maps_to_sentinel() {
        let m = mapper(Layout::OriginRooted);
        assert_eq!(
            m.local_path("http://[::1"),
            PathBuf::from("/out/_external/unknown/error.html")
        );
        assert_eq!(m.local_path("::nonsense::"), m.fallback_path());
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let m = mapper(Layout::PerHost);
        for url in [
            "https://example.com/",
            "https://example.com/a/b?c=d",
            "http://other.org:81/x/y.png",
            "garbage",
        ] {
            assert_eq!(m.local_path(url), m.local_path(url), "unstable mapping for {}", url);
        }
    }

    #[test]
    fn test_relative_reference_between_siblings_and_hosts() {
        let page = Path::new("/out/example.com/a/index.html");
        assert_eq!(
            relative_reference(page, Path::new("/out/example.com/style.css")),
            "../style.css"
        );
        assert_eq!(
            relative_reference(page, Path::new("/out/example.com/a/img/logo.png")),
            "img/logo.png"
        );
        assert_eq!(
            relative_reference(page, Path::new("/out/cdn.example.com/lib.js")),
            "../../cdn.example.com/lib.js"
        );
    }

    #[test]
    fn test_relative_reference_escapes_percent() {
        let page = Path::new("/out/example.com/index.html");
        assert_eq!(
            relative_reference(page, Path::new("/out/example.com/my%20file.css")),
            "my%2520file.css"
        );
    }
}
