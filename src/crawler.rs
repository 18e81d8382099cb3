//! Static-mode crawl driver.
//!
//! Pages are processed from an explicit work list rather than by recursion.
//! With one page in flight the traversal is depth-first in document order;
//! larger limits process up to `max_concurrent` pages at a time. Page
//! fetches get a single attempt, and a page that cannot be fetched,
//! rewritten or saved is logged and skipped without stopping the run.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BoundaryLinks;
use crate::context::RunContext;
use crate::error::{FetchError, RewriteError};
use crate::fetcher::ResourceFetcher;
use crate::rewriter::{AssetResolver, DocumentRewriter, LinkHandling};

/// A page waiting to be processed and how many links away from the start
/// page it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTarget {
    pub url: Url,
    pub depth: usize,
}

/// Why a page was skipped.
#[derive(Debug, Error)]
enum PageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("rewrite failed: {0}")]
    Rewrite(#[from] RewriteError),
    #[error("failed to save {path}: {message}")]
    Save { path: String, message: String },
}

/// A fetched page body, split by whether it gets rewritten.
enum PageBody {
    Html { markup: String, final_url: Url },
    Other(Vec<u8>),
}

pub struct Crawler<'a> {
    ctx: &'a RunContext,
    progress: ProgressBar,
}

impl<'a> Crawler<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        let progress = if ctx.config.show_progress {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };

        Self { ctx, progress }
    }

    /// Crawls from the start URL until the work list drains.
    pub async fn run(&self) {
        let config = &self.ctx.config;
        info!(
            url = %config.start_url,
            max_depth = config.max_depth,
            max_concurrent = config.max_concurrent,
            "starting static mirror"
        );

        let mut pending = vec![CrawlTarget {
            url: config.start_url.clone(),
            depth: 0,
        }];
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < config.max_concurrent {
                let Some(target) = pending.pop() else { break };
                if target.depth > config.max_depth {
                    continue;
                }
                if !self.ctx.visited.insert(target.url.as_str()) {
                    debug!(url = %target.url, "already visited");
                    continue;
                }
                in_flight.push(self.process(target));
            }

            match in_flight.next().await {
                // Reversed so the first link found is the next one popped.
                Some(children) => pending.extend(children.into_iter().rev()),
                None => break,
            }
        }

        self.progress.finish_and_clear();
        info!(pages = self.ctx.visited.len(), "static mirror finished");
    }

    async fn process(&self, target: CrawlTarget) -> Vec<CrawlTarget> {
        self.progress
            .set_message(format!("Downloading: {}", target.url));

        match self.mirror_page(&target).await {
            Ok(links) => {
                self.ctx.record_page_saved(target.url.as_str());
                if target.depth < self.ctx.config.max_depth {
                    links
                        .into_iter()
                        .map(|url| CrawlTarget {
                            url,
                            depth: target.depth + 1,
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            }
            Err(err) => {
                warn!(url = %target.url, depth = target.depth, error = %err, "skipping page");
                self.ctx.record_page_failed(target.url.as_str(), &err);
                Vec::new()
            }
        }
    }

    /// Fetches, rewrites and saves one page. Returns the same-domain links
    /// it contains.
    async fn mirror_page(&self, target: &CrawlTarget) -> Result<Vec<Url>, PageError> {
        let local_path = self.ctx.mapper.local_path_for(&target.url);

        let (bytes, links) = match self.fetch_page(&target.url).await? {
            PageBody::Html { markup, final_url } => {
                let rewriter = DocumentRewriter::new(
                    AssetResolver::Fetch(ResourceFetcher::new(self.ctx)),
                    self.link_handling(target.depth),
                );
                let result = rewriter
                    .rewrite_at(&markup, &final_url, local_path.clone())
                    .await?;
                (result.markup.into_bytes(), result.links)
            }
            PageBody::Other(bytes) => {
                debug!(url = %target.url, "not HTML, saving verbatim");
                (bytes, Vec::new())
            }
        };

        self.ctx
            .files
            .write_atomic(&local_path, &bytes)
            .await
            .map_err(|err| PageError::Save {
                path: local_path.display().to_string(),
                message: err.to_string(),
            })?;

        info!(
            url = %target.url,
            depth = target.depth,
            path = %local_path.display(),
            links = links.len(),
            "saved page"
        );
        Ok(links)
    }

    fn link_handling(&self, depth: usize) -> LinkHandling {
        let config = &self.ctx.config;
        if depth >= config.max_depth && config.boundary_links == BoundaryLinks::Remote {
            LinkHandling::Remote
        } else {
            LinkHandling::Local
        }
    }

    async fn fetch_page(&self, url: &Url) -> Result<PageBody, FetchError> {
        let transport = |err: reqwest::Error| FetchError::from_transport(url.as_str(), &err);

        let response = self.ctx.client.get(url.clone()).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        if final_url != *url {
            debug!(url = %url, final_url = %final_url, "page redirected");
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        match content_type.as_deref() {
            Some(ct) if is_html_content_type(ct) => {
                let markup = response.text().await.map_err(transport)?;
                Ok(PageBody::Html { markup, final_url })
            }
            Some(_) => {
                let bytes = response.bytes().await.map_err(transport)?;
                Ok(PageBody::Other(bytes.to_vec()))
            }
            None => {
                let bytes = response.bytes().await.map_err(transport)?;
                if looks_like_html(&bytes) {
                    Ok(PageBody::Html {
                        markup: String::from_utf8_lossy(&bytes).into_owned(),
                        final_url,
                    })
                } else {
                    Ok(PageBody::Other(bytes.to_vec()))
                }
            }
        }
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    content_type.contains("text/html") || content_type.contains("application/xhtml")
}

/// Sniffs an untyped body for an HTML document start.
fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let text = text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .to_ascii_lowercase();
    text.starts_with("<!doctype html") || text.starts_with("<html")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_content_types() {
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(!is_html_content_type("application/json"));
        assert!(!is_html_content_type("text/css"));
    }

    #[test]
    fn test_sniffs_untyped_documents() {
        assert!(looks_like_html(b"<!DOCTYPE html><html></html>"));
        assert!(looks_like_html(b"\xef\xbb\xbf  \n<HTML lang=\"en\">"));
        assert!(!looks_like_html(b"{\"a\": 1}"));
        assert!(!looks_like_html(b""));
    }
}
