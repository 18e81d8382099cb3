use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use site_mirror::{mirror, MirrorCommand, MirrorReport};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = MirrorCommand::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let quiet = args.quiet;
    let report_path = args.report.clone();
    let config = args.into_config()?;

    if !quiet {
        println!("🚀 Mirroring {}", config.start_url.as_str().blue());
        println!("📁 Output directory: {:?}", config.output_dir);
    }

    let report = mirror(config).await?;

    if let Some(path) = &report_path {
        report.write_json(path)?;
    }
    if !quiet {
        print_summary(&report);
    }

    if report.root_saved() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{} start page could not be saved", "❌".red());
        Ok(ExitCode::FAILURE)
    }
}

fn print_summary(report: &MirrorReport) {
    println!("📊 Pages saved: {}", report.pages_saved.len().to_string().green());
    if !report.pages_failed.is_empty() {
        println!("⚠️  Pages failed: {}", report.pages_failed.len().to_string().yellow());
    }
    println!(
        "📦 Assets: {} fetched, {} reused, {} failed",
        report.assets_fetched.to_string().green(),
        report.assets_reused,
        report.assets_failed.len().to_string().yellow()
    );
    println!("⏱️  Finished in {:.1}s", report.elapsed_ms as f64 / 1000.0);
}
