use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::MirrorMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub url: String,
    pub reason: String,
}

/// What a run achieved. Partial success is normal; the run only counts as
/// failed when the start page itself could not be saved.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    pub start_url: String,
    pub mode: MirrorMode,
    pub output_dir: PathBuf,
    pub pages_saved: Vec<String>,
    pub pages_failed: Vec<FailedItem>,
    /// Resources written during this run.
    pub assets_fetched: usize,
    /// Resources already on disk from an earlier run.
    pub assets_reused: usize,
    pub assets_failed: Vec<FailedItem>,
    pub elapsed_ms: u64,
}

impl MirrorReport {
    pub fn root_saved(&self) -> bool {
        self.pages_saved.iter().any(|url| url == &self.start_url)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> MirrorReport {
        MirrorReport {
            start_url: "https://example.com/".to_string(),
            mode: MirrorMode::Static,
            output_dir: PathBuf::from("out"),
            pages_saved: vec!["https://example.com/".to_string()],
            pages_failed: vec![],
            assets_fetched: 2,
            assets_reused: 0,
            assets_failed: vec![FailedItem {
                url: "https://example.com/missing.png".to_string(),
                reason: "HTTP 404".to_string(),
            }],
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_root_saved() {
        let mut report = report();
        assert!(report.root_saved());
        report.pages_saved.clear();
        assert!(!report.root_saved());
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["mode"], "static");
        assert_eq!(value["assets_fetched"], 2);
        assert_eq!(value["assets_failed"][0]["reason"], "HTTP 404");
    }
}
