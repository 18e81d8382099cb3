//! The run context: one value holding configuration, transport and the
//! shared per-run sets, passed by reference to every component.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, ClientBuilder};
use tracing::debug;

use crate::config::MirrorConfig;
use crate::file_manager::FileManager;
use crate::path_mapper::PathMapper;
use crate::report::{FailedItem, MirrorReport};
use crate::state::{DownloadedSet, VisitedSet};

#[derive(Debug, Default)]
struct PageLog {
    saved: Vec<String>,
    failed: Vec<FailedItem>,
}

pub struct RunContext {
    pub config: MirrorConfig,
    pub client: Client,
    pub mapper: PathMapper,
    pub files: FileManager,
    pub visited: VisitedSet,
    pub downloaded: DownloadedSet,
    pages: Mutex<PageLog>,
    started: Instant,
}

impl RunContext {
    /// Creates the output root and the HTTP client. Failing here is the only
    /// way a run aborts before doing any work.
    pub fn new(config: MirrorConfig) -> Result<Self> {
        let files = FileManager::new(&config.output_dir)?;
        let client = build_http_client(&config)?;
        let mapper = PathMapper::new(files.base_dir(), &config.start_url, config.layout);

        Ok(Self {
            config,
            client,
            mapper,
            files,
            visited: VisitedSet::new(),
            downloaded: DownloadedSet::new(),
            pages: Mutex::new(PageLog::default()),
            started: Instant::now(),
        })
    }

    pub fn record_page_saved(&self, url: &str) {
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        pages.saved.push(url.to_string());
    }

    pub fn record_page_failed(&self, url: &str, reason: impl ToString) {
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        pages.failed.push(FailedItem {
            url: url.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn report(&self) -> MirrorReport {
        let pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);

        let mut assets_fetched = 0;
        let mut assets_reused = 0;
        let mut assets_failed = Vec::new();
        for (url, outcome) in self.downloaded.snapshot() {
            match outcome {
                Ok(localized) if localized.fetched => assets_fetched += 1,
                Ok(_) => assets_reused += 1,
                Err(err) => assets_failed.push(FailedItem {
                    url,
                    reason: err.to_string(),
                }),
            }
        }

        MirrorReport {
            start_url: self.config.start_url.to_string(),
            mode: self.config.mode,
            output_dir: self.files.base_dir().to_path_buf(),
            pages_saved: pages.saved.clone(),
            pages_failed: pages.failed.clone(),
            assets_fetched,
            assets_reused,
            assets_failed,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

fn build_http_client(config: &MirrorConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    // Host-only cookies: sent to the origin and nowhere else.
    let jar = Arc::new(Jar::default());
    for (name, value) in &config.cookies {
        jar.add_cookie_str(&format!("{}={}; Path=/", name, value), &config.start_url);
    }
    debug!(count = config.cookies.len(), "cookies loaded for origin");

    let client = ClientBuilder::new()
        .use_rustls_tls()
        .user_agent(config.user_agent.as_str())
        .default_headers(headers)
        .cookie_provider(jar)
        .timeout(config.timeout)
        .connect_timeout(config.timeout)
        .build()
        .context("Failed to build HTTP client")?;

    Ok(client)
}
