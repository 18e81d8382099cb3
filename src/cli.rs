use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::config::{
    parse_cookies, BoundaryLinks, MirrorConfig, DEFAULT_OUTPUT_DIR, DEFAULT_USER_AGENT,
};
use crate::path_mapper::Layout;
use crate::retry::RetryPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "site-mirror",
    about = "Download a browsable local copy of a website",
    version,
    long_about = "Downloads a page and the stylesheets, scripts and images it references, follows same-domain links to a depth limit, and rewrites references so the copy opens from disk. With --render, loads the page in headless Chromium instead and saves what the browser fetched along with the rendered DOM."
)]
pub struct MirrorCommand {
    /// The page to start from
    #[arg(env = "SITE_URL")]
    pub url: String,

    /// Output directory for the mirrored site
    #[arg(short, long, env = "OUTPUT_DIR", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// How many links away from the start page to follow (0 = start page only)
    #[arg(short = 'd', long, env = "MAX_DEPTH", default_value = "1")]
    pub max_depth: usize,

    /// Cookies sent to the start page's host, as "name=value; name2=value2"
    #[arg(long, env = "COOKIES")]
    pub cookies: Option<String>,

    /// User agent string to use for requests
    #[arg(long, env = "USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Render the start page in headless Chromium instead of crawling
    #[arg(long)]
    pub render: bool,

    /// Output layout (default: per-host, or origin-rooted with --render)
    #[arg(long, value_enum)]
    pub layout: Option<Layout>,

    /// Pages and assets processed at once
    #[arg(short = 'c', long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
    pub max_concurrent: u16,

    /// Timeout for requests in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Attempts per asset, including the first
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    /// Where same-domain links on pages at the depth limit point
    #[arg(long, value_enum, default_value = "local")]
    pub boundary_links: BoundaryLinks,

    /// Leave downloaded stylesheets untouched
    #[arg(long)]
    pub no_css_rewrite: bool,

    /// Write a JSON summary of the run to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Chromium executable for --render
    #[arg(long, env = "CHROME")]
    pub chrome: Option<PathBuf>,

    /// More log output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only warnings and errors, no progress spinner
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl MirrorCommand {
    pub fn into_config(self) -> Result<MirrorConfig> {
        let mut config = MirrorConfig::new(&self.url, self.output_dir)?;
        if self.render {
            config = config.rendered();
        }
        if let Some(layout) = self.layout {
            config = config.with_layout(layout);
        }
        config.render.chrome_executable = self.chrome;

        Ok(config
            .with_max_depth(self.max_depth)
            .with_cookies(self.cookies.as_deref().map(parse_cookies).unwrap_or_default())
            .with_user_agent(self.user_agent)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_retry(RetryPolicy::with_max_attempts(self.retries))
            .with_max_concurrent(usize::from(self.max_concurrent))
            .with_boundary_links(self.boundary_links)
            .with_css_rewrite(!self.no_css_rewrite)
            .with_progress(!self.quiet))
    }

    /// Default `RUST_LOG` filter for the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }
}
