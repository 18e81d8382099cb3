//! Resource fetcher: makes sure a remote resource has a local copy.
//!
//! Every URL is attempted at most once per run. The outcome (success or
//! failure) is remembered in the run's [`DownloadedSet`](crate::state::DownloadedSet)
//! and replayed to later callers without touching the network.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::FetchError;
use crate::retry::{classify, RetryDecision};
use crate::state::Localized;
use crate::url_filter::is_fetchable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// This call localized the resource. `fetched` is false when the file
    /// was already on disk and no request was made.
    Success { path: PathBuf, fetched: bool },
    /// An earlier call in this run already localized it.
    Skipped(PathBuf),
    Failed(FetchError),
}

#[derive(Clone, Copy)]
pub struct ResourceFetcher<'a> {
    ctx: &'a RunContext,
}

impl<'a> ResourceFetcher<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &'a RunContext {
        self.ctx
    }

    pub async fn ensure_local(&self, url: &str) -> FetchOutcome {
        if !is_fetchable(url) {
            return FetchOutcome::Failed(FetchError::Unfetchable {
                url: url.to_string(),
            });
        }

        let (result, first) = self
            .ctx
            .downloaded
            .attempt_once(url, || self.localize(url))
            .await;

        match result {
            Ok(Localized { path, fetched }) if first => FetchOutcome::Success { path, fetched },
            Ok(Localized { path, .. }) => FetchOutcome::Skipped(path),
            Err(err) => FetchOutcome::Failed(err),
        }
    }

    async fn localize(&self, url: &str) -> Result<Localized, FetchError> {
        let path = self.ctx.mapper.local_path(url);

        if self.ctx.files.file_exists(&path).await {
            debug!(url, path = %path.display(), "already on disk");
            return Ok(Localized {
                path,
                fetched: false,
            });
        }

        let policy = &self.ctx.config.retry;
        let mut attempt = 1;
        loop {
            match self.download(url, &path).await {
                Ok(bytes) => {
                    info!(url, bytes, path = %path.display(), "saved resource");
                    return Ok(Localized {
                        path,
                        fetched: true,
                    });
                }
                Err(err) => match policy.should_retry(classify(&err), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        warn!(url, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying resource");
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(url, error = %err, reason = %reason, "giving up on resource");
                        return Err(err);
                    }
                },
            }
        }
    }

    /// One request, streamed to a temporary file that only replaces `target`
    /// once the whole body has arrived.
    async fn download(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        let response = self
            .ctx
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_transport(url, &err))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut pending = self
            .ctx
            .files
            .begin(target)
            .await
            .map_err(|err| FetchError::io(target, &err))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| FetchError::from_transport(url, &err))?;
            pending
                .write_chunk(&chunk)
                .await
                .map_err(|err| FetchError::io(target, &err))?;
        }

        let written = pending.bytes_written();
        pending
            .commit()
            .await
            .map_err(|err| FetchError::io(target, &err))?;
        Ok(written)
    }
}
