//! Stylesheet references: `url(...)` and `@import "..."`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};
use url::Url;

use crate::path_mapper::relative_reference;
use crate::rewriter::{AssetResolver, Resolution};
use crate::url_filter::is_inert_reference;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"\s]+))\s*\)|@import\s+(?:"([^"]*)"|'([^']*)')"#,
        )
        .expect("stylesheet reference pattern is valid")
    })
}

/// Which form a reference was written in, so a rewrite keeps the quoting.
fn reference_parts<'c>(caps: &Captures<'c>) -> Option<(&'c str, &'static str, &'static str)> {
    [
        (1, "url(\"", "\")"),
        (2, "url('", "')"),
        (3, "url(", ")"),
        (4, "@import \"", "\""),
        (5, "@import '", "'"),
    ]
    .into_iter()
    .find_map(|(group, open, close)| caps.get(group).map(|m| (m.as_str(), open, close)))
}

pub fn css_references(css: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in reference_pattern().captures_iter(css) {
        if let Some((raw, _, _)) = reference_parts(&caps) {
            if !seen.iter().any(|s| s == raw) {
                seen.push(raw.to_string());
            }
        }
    }
    seen
}

pub fn rewrite_css(css: &str, replacements: &HashMap<String, String>) -> String {
    reference_pattern()
        .replace_all(css, |caps: &Captures| match reference_parts(caps) {
            Some((raw, open, close)) => match replacements.get(raw) {
                Some(value) => format!("{}{}{}", open, value, close),
                None => caps[0].to_string(),
            },
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn is_stylesheet_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("css"))
}

/// Rewrites a saved stylesheet so its references point at local files.
///
/// With a fetching resolver, stylesheets pulled in by `@import` (or any
/// other freshly downloaded `.css` reference) are processed in turn; the
/// dedup set keeps import cycles from looping.
pub async fn localize_stylesheet(resolver: AssetResolver<'_>, css_url: Url, css_path: PathBuf) {
    let files = &resolver.context().files;
    let mut pending = vec![(css_url, css_path)];

    while let Some((url, path)) = pending.pop() {
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) => {
                debug!(url = %url, error = %err, "stylesheet is not readable text, leaving as is");
                continue;
            }
        };

        let mut replacements = HashMap::new();
        for raw in css_references(&text) {
            if is_inert_reference(&raw) || raw.trim_start().starts_with('#') {
                continue;
            }
            let target = match url.join(raw.trim()) {
                Ok(target) => target,
                Err(_) => continue,
            };

            let value = match resolver.resolve(&target).await {
                Resolution::Local { path: local, fetched } => {
                    if fetched && is_stylesheet_path(&local) {
                        pending.push((target.clone(), local.clone()));
                    }
                    relative_reference(&path, &local)
                }
                Resolution::Remote => target.to_string(),
            };
            if value != raw {
                replacements.insert(raw, value);
            }
        }

        if replacements.is_empty() {
            continue;
        }

        let rewritten = rewrite_css(&text, &replacements);
        match files.write_atomic(&path, rewritten.as_bytes()).await {
            Ok(_) => debug!(url = %url, references = replacements.len(), "stylesheet rewritten"),
            Err(err) => warn!(url = %url, error = %err, "failed to rewrite stylesheet"),
        }
    }
}
