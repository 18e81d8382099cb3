pub mod cli;
pub mod config;
pub mod context;
pub mod crawler;
pub mod css;
pub mod error;
pub mod fetcher;
pub mod file_manager;
pub mod html_parser;
pub mod path_mapper;
pub mod render;
pub mod report;
pub mod retry;
pub mod rewriter;
pub mod state;
pub mod url_filter;

// Re-export main types for convenience
pub use cli::MirrorCommand;
pub use config::{BoundaryLinks, MirrorConfig, MirrorMode, RenderOptions};
pub use context::RunContext;
pub use crawler::Crawler;
pub use error::{FetchError, RewriteError};
pub use fetcher::{FetchOutcome, ResourceFetcher};
pub use file_manager::FileManager;
pub use path_mapper::{Layout, PathMapper};
pub use render::RenderDriver;
pub use report::MirrorReport;
pub use retry::RetryPolicy;

/// Runs one mirror to completion.
///
/// Errors only when the run cannot start (output directory, HTTP client,
/// browser launch). Per-page and per-asset failures end up in the report.
pub async fn mirror(config: MirrorConfig) -> anyhow::Result<MirrorReport> {
    let ctx = RunContext::new(config)?;
    match ctx.config.mode {
        MirrorMode::Static => Crawler::new(&ctx).run().await,
        MirrorMode::Render => RenderDriver::new(&ctx).run().await?,
    }
    Ok(ctx.report())
}
