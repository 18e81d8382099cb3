//! Document rewriter: points a page's references at the mirror.
//!
//! Asset references (stylesheets, scripts, images) become paths relative to
//! the page's own file when the asset was localized, and the absolute remote
//! URL when it was not, so the saved page falls back to the network.
//! Same-domain hyperlinks become relative paths to where the linked page
//! lives in the mirror and are reported back to the crawl driver.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tracing::debug;
use url::Url;

use crate::context::RunContext;
use crate::css::{is_stylesheet_path, localize_stylesheet};
use crate::error::RewriteError;
use crate::fetcher::{FetchOutcome, ResourceFetcher};
use crate::html_parser::{
    apply_replacements, decode_reference, extract_references, Reference, ReferenceKind,
    Replacements,
};
use crate::path_mapper::relative_reference;
use crate::url_filter::{is_fetchable, is_inert_reference, is_same_domain};

/// Where asset references get their local files from.
#[derive(Clone, Copy)]
pub enum AssetResolver<'a> {
    /// Static mode: download on demand.
    Fetch(ResourceFetcher<'a>),
    /// Render mode: the browser already loaded everything; only look up
    /// what the capture recorded.
    Recorded(&'a RunContext),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Local { path: PathBuf, fetched: bool },
    Remote,
}

impl<'a> AssetResolver<'a> {
    pub fn context(&self) -> &'a RunContext {
        match self {
            Self::Fetch(fetcher) => fetcher.context(),
            Self::Recorded(ctx) => ctx,
        }
    }

    pub async fn resolve(&self, url: &Url) -> Resolution {
        match self {
            Self::Fetch(fetcher) => match fetcher.ensure_local(url.as_str()).await {
                FetchOutcome::Success { path, fetched } => Resolution::Local { path, fetched },
                FetchOutcome::Skipped(path) => Resolution::Local {
                    path,
                    fetched: false,
                },
                FetchOutcome::Failed(_) => Resolution::Remote,
            },
            Self::Recorded(ctx) => match ctx.downloaded.localized_path(url.as_str()) {
                Some(path) => Resolution::Local {
                    path,
                    fetched: false,
                },
                None => Resolution::Remote,
            },
        }
    }
}

/// The document being rewritten: its URL for resolving references and its
/// local path for computing relative ones.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub document_url: Url,
    pub local_path: PathBuf,
}

impl RewriteContext {
    pub fn resolve(&self, raw: &str) -> Option<Url> {
        if is_inert_reference(raw) {
            return None;
        }
        self.document_url.join(&decode_reference(raw)).ok()
    }

    pub fn reference_to(&self, target: &Path) -> String {
        relative_reference(&self.local_path, target)
    }
}

/// How hyperlinks are treated in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHandling {
    /// Render mode: hyperlinks are not touched.
    Ignore,
    /// Rewrite same-domain links to local paths and report them.
    Local,
    /// Report same-domain links but point them at the remote page.
    Remote,
}

#[derive(Debug)]
pub struct RewriteResult {
    pub markup: String,
    /// Same-domain pages linked from the document, fragment-stripped, in
    /// document order, without duplicates.
    pub links: Vec<Url>,
}

pub struct DocumentRewriter<'a> {
    resolver: AssetResolver<'a>,
    links: LinkHandling,
}

impl<'a> DocumentRewriter<'a> {
    pub fn new(resolver: AssetResolver<'a>, links: LinkHandling) -> Self {
        Self { resolver, links }
    }

    /// Rewrites a document saved at the path its URL maps to.
    pub async fn rewrite(
        &self,
        markup: &str,
        document_url: &Url,
    ) -> Result<RewriteResult, RewriteError> {
        let local_path = self.resolver.context().mapper.local_path_for(document_url);
        self.rewrite_at(markup, document_url, local_path).await
    }

    /// Rewrites a document whose references resolve against `base_url` but
    /// which is saved at `local_path` (a redirected page keeps the path of
    /// the URL that linked to it).
    pub async fn rewrite_at(
        &self,
        markup: &str,
        base_url: &Url,
        local_path: PathBuf,
    ) -> Result<RewriteResult, RewriteError> {
        if base_url.cannot_be_a_base() {
            return Err(RewriteError::InvalidBase(base_url.to_string()));
        }

        let ctx = self.resolver.context();
        let rewrite_ctx = RewriteContext {
            document_url: base_url.clone(),
            local_path,
        };
        let document_url = base_url;

        let references = extract_references(markup)?;
        let mut replacements = Replacements::new();

        self.localize_assets(&rewrite_ctx, &references, &mut replacements)
            .await;
        let links = match self.links {
            LinkHandling::Ignore => Vec::new(),
            handling => collect_links(ctx, &rewrite_ctx, &references, handling, &mut replacements),
        };

        debug!(
            url = %document_url,
            references = references.len(),
            rewritten = replacements.len(),
            links = links.len(),
            "document rewritten"
        );

        Ok(RewriteResult {
            markup: apply_replacements(markup, &replacements)?,
            links,
        })
    }

    async fn localize_assets(
        &self,
        rewrite_ctx: &RewriteContext,
        references: &[Reference],
        replacements: &mut Replacements,
    ) {
        let mut seen = HashSet::new();
        let assets: Vec<(ReferenceKind, String, Url)> = references
            .iter()
            .filter(|r| r.kind.is_asset())
            .filter(|r| seen.insert((r.kind, r.raw.clone())))
            .filter_map(|r| {
                let url = rewrite_ctx.resolve(&r.raw)?;
                is_fetchable(url.as_str()).then(|| (r.kind, r.raw.clone(), url))
            })
            .collect();

        let ctx = self.resolver.context();
        let resolver = self.resolver;
        let rewrite_css = ctx.config.rewrite_css;

        let resolved: Vec<(ReferenceKind, String, Url, Resolution)> = stream::iter(assets)
            .map(|(kind, raw, url)| async move {
                let resolution = resolver.resolve(&url).await;
                if let Resolution::Local {
                    path,
                    fetched: true,
                } = &resolution
                {
                    if rewrite_css && kind == ReferenceKind::Stylesheet && is_stylesheet_path(path) {
                        localize_stylesheet(resolver, url.clone(), path.clone()).await;
                    }
                }
                (kind, raw, url, resolution)
            })
            .buffered(ctx.config.max_concurrent)
            .collect()
            .await;

        for (kind, raw, url, resolution) in resolved {
            let value = match resolution {
                Resolution::Local { path, .. } => rewrite_ctx.reference_to(&path),
                Resolution::Remote => url.to_string(),
            };
            if value != raw {
                replacements.insert((kind, raw), value);
            }
        }
    }
}

fn collect_links(
    ctx: &RunContext,
    rewrite_ctx: &RewriteContext,
    references: &[Reference],
    handling: LinkHandling,
    replacements: &mut Replacements,
) -> Vec<Url> {
    let origin = &ctx.config.start_url;
    let mut links = Vec::new();
    let mut seen = HashSet::new();

    for reference in references.iter().filter(|r| r.kind == ReferenceKind::Hyperlink) {
        // In-page anchors keep working as written.
        if reference.raw.trim_start().starts_with('#') {
            continue;
        }
        let mut url = match rewrite_ctx.resolve(&reference.raw) {
            Some(url) if is_fetchable(url.as_str()) => url,
            _ => continue,
        };
        let fragment = url.fragment().map(str::to_string);
        url.set_fragment(None);

        let value = if is_same_domain(&url, origin) {
            if seen.insert(url.clone()) {
                links.push(url.clone());
            }
            match handling {
                LinkHandling::Local => {
                    let local = rewrite_ctx.reference_to(&ctx.mapper.local_path_for(&url));
                    with_fragment(local, fragment.as_deref())
                }
                _ => with_fragment(url.to_string(), fragment.as_deref()),
            }
        } else {
            with_fragment(url.to_string(), fragment.as_deref())
        };

        if value != reference.raw {
            replacements.insert((ReferenceKind::Hyperlink, reference.raw.clone()), value);
        }
    }

    links
}

fn with_fragment(base: String, fragment: Option<&str>) -> String {
    match fragment {
        Some(fragment) if !fragment.is_empty() => format!("{}#{}", base, fragment),
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use crate::error::FetchError;
    use crate::path_mapper::Layout;
    use crate::state::{AttemptResult, Localized};
    use tempfile::{tempdir, TempDir};

    fn recorded_context(start: &str) -> (TempDir, RunContext) {
        let out = tempdir().unwrap();
        let config = MirrorConfig::new(start, out.path())
            .unwrap()
            .rendered()
            .with_layout(Layout::OriginRooted);
        let ctx = RunContext::new(config).unwrap();
        (out, ctx)
    }

    async fn record(ctx: &RunContext, url: &str, result: AttemptResult) {
        ctx.downloaded.attempt_once(url, || async move { result }).await;
    }

    async fn record_saved(ctx: &RunContext, url: &str) -> PathBuf {
        let path = ctx.mapper.local_path(url);
        let localized = Localized {
            path: path.clone(),
            fetched: true,
        };
        record(ctx, url, Ok(localized)).await;
        path
    }

    async fn record_failed(ctx: &RunContext, url: &str) {
        let error = FetchError::HttpStatus {
            url: url.to_string(),
            status: 404,
        };
        record(ctx, url, Err(error)).await;
    }

    #[tokio::test]
    async fn test_recorded_assets_become_relative_and_links_stay() {
        let (_out, ctx) = recorded_context("https://example.com/docs/");
        record_saved(&ctx, "https://example.com/css/site.css").await;
        record_saved(&ctx, "https://cdn.example.net/lib.js").await;
        record_failed(&ctx, "https://example.com/docs/missing.png").await;

        let markup = r#"<link rel="stylesheet" href="/css/site.css">
<script src="https://cdn.example.net/lib.js"></script>
<img src="missing.png"><img src="/never-loaded.gif">
<a href="/about">About</a><a href="guide.html#setup">Guide</a><a href="https://other.org/">Other</a>"#;

        let rewriter = DocumentRewriter::new(AssetResolver::Recorded(&ctx), LinkHandling::Ignore);
        let document = Url::parse("https://example.com/docs/").unwrap();
        let result = rewriter.rewrite(markup, &document).await.unwrap();

        assert_eq!(
            result.markup,
            r#"<link rel="stylesheet" href="../css/site.css">
<script src="../_external/cdn.example.net/lib.js"></script>
<img src="https://example.com/docs/missing.png"><img src="https://example.com/never-loaded.gif">
<a href="/about">About</a><a href="guide.html#setup">Guide</a><a href="https://other.org/">Other</a>"#
        );
        assert!(result.links.is_empty());
        // Lookups never create new entries.
        assert_eq!(ctx.downloaded.len(), 3);
    }

    #[tokio::test]
    async fn test_recorded_stylesheet_points_at_captured_files() {
        let (_out, ctx) = recorded_context("https://example.com/");
        let css_url = "https://example.com/css/site.css";
        let css_path = record_saved(&ctx, css_url).await;
        let theme_path = record_saved(&ctx, "https://example.com/css/theme.css").await;
        record_saved(&ctx, "https://example.com/img/bg.png").await;
        record_failed(&ctx, "https://example.com/img/gone.png").await;

        ctx.files
            .write_atomic(&theme_path, b".t { background: url(/img/bg.png); }")
            .await
            .unwrap();
        ctx.files
            .write_atomic(
                &css_path,
                br#"@import "/css/theme.css";
.a { background: url(/img/bg.png); }
.b { background: url('/img/gone.png'); }"#,
            )
            .await
            .unwrap();

        localize_stylesheet(
            AssetResolver::Recorded(&ctx),
            Url::parse(css_url).unwrap(),
            css_path.clone(),
        )
        .await;

        assert_eq!(
            std::fs::read_to_string(&css_path).unwrap(),
            r#"@import "theme.css";
.a { background: url(../img/bg.png); }
.b { background: url('https://example.com/img/gone.png'); }"#
        );
        // Captured stylesheets are each localized on their own; imports are
        // not walked from here.
        assert_eq!(
            std::fs::read_to_string(&theme_path).unwrap(),
            ".t { background: url(/img/bg.png); }"
        );
    }
}
