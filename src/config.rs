use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use url::Url;

use crate::path_mapper::Layout;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub const DEFAULT_OUTPUT_DIR: &str = "downloaded_site";
pub const DEFAULT_MAX_DEPTH: usize = 1;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorMode {
    /// Fetch raw documents and crawl same-domain links.
    Static,
    /// Render one page in a headless browser and capture what it loads.
    Render,
}

/// What happens to same-domain links on pages at the depth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryLinks {
    /// Point them at where the page would live locally, even though it was
    /// never fetched.
    Local,
    /// Point them at the remote page.
    Remote,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub chrome_executable: Option<PathBuf>,
    pub viewport: (u32, u32),
    pub navigation_timeout: Duration,
    /// Quiet period without network events that counts as quiescence.
    pub idle_window: Duration,
    /// Upper bound on the quiescence wait.
    pub quiescence_timeout: Duration,
    /// Extra wait after quiescence for trailing script work.
    pub grace_period: Duration,
    pub capture_buffer: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            viewport: (1920, 1080),
            navigation_timeout: Duration::from_secs(60),
            idle_window: Duration::from_millis(500),
            quiescence_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(2),
            capture_buffer: 64,
        }
    }
}

/// Everything a run needs to know, validated.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub start_url: Url,
    pub output_dir: PathBuf,
    pub mode: MirrorMode,
    pub max_depth: usize,
    pub layout: Layout,
    pub cookies: Vec<(String, String)>,
    pub user_agent: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_concurrent: usize,
    pub boundary_links: BoundaryLinks,
    pub rewrite_css: bool,
    pub show_progress: bool,
    pub render: RenderOptions,
}

impl MirrorConfig {
    /// Static-mode configuration with defaults for everything but the
    /// start URL and output directory.
    pub fn new(start_url: &str, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut start_url = Url::parse(start_url)
            .with_context(|| format!("Failed to parse start URL: {}", start_url))?;
        if !matches!(start_url.scheme(), "http" | "https") || start_url.host_str().is_none() {
            bail!("Start URL must be an absolute http(s) URL: {}", start_url);
        }
        start_url.set_fragment(None);

        Ok(Self {
            start_url,
            output_dir: output_dir.into(),
            mode: MirrorMode::Static,
            max_depth: DEFAULT_MAX_DEPTH,
            layout: Layout::PerHost,
            cookies: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            max_concurrent: 1,
            boundary_links: BoundaryLinks::Local,
            rewrite_css: true,
            show_progress: false,
            render: RenderOptions::default(),
        })
    }

    /// Switches to render mode and its default layout.
    pub fn rendered(mut self) -> Self {
        self.mode = MirrorMode::Render;
        self.layout = Layout::OriginRooted;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_cookies(mut self, cookies: Vec<(String, String)>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_boundary_links(mut self, boundary_links: BoundaryLinks) -> Self {
        self.boundary_links = boundary_links;
        self
    }

    pub fn with_css_rewrite(mut self, enabled: bool) -> Self {
        self.rewrite_css = enabled;
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }
}

/// Parses `name=value; name2=value2`. Malformed pairs are skipped.
pub fn parse_cookies(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|item| {
            let (name, value) = item.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
