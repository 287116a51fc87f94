//! Run counters and the per-run report files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soundcat_core::Tier;
use soundcat_match::Assessment;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub auto: usize,
    pub pending: usize,
    pub new_products: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub items_total: usize,
    pub items_resumed: usize,
    pub items_completed: usize,
    pub candidates: usize,
    pub auto: usize,
    pub pending: usize,
    pub no_match: usize,
    pub skipped: usize,
    pub junk: usize,
    pub new_products: usize,
    pub conflicts: usize,
    pub review_tasks: usize,
    pub errors: usize,
    pub store_errors: usize,
    pub antibot_events: usize,
    pub flushes: usize,
    pub per_category: BTreeMap<String, CategoryCounts>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            dry_run,
            items_total: 0,
            items_resumed: 0,
            items_completed: 0,
            candidates: 0,
            auto: 0,
            pending: 0,
            no_match: 0,
            skipped: 0,
            junk: 0,
            new_products: 0,
            conflicts: 0,
            review_tasks: 0,
            errors: 0,
            store_errors: 0,
            antibot_events: 0,
            flushes: 0,
            per_category: BTreeMap::new(),
        }
    }

    pub fn record_assessment(&mut self, category: &str, assessment: &Assessment) {
        self.candidates += 1;
        let skipped = assessment.is_skipped();
        let counts = self.per_category.entry(category.to_string()).or_default();
        match assessment {
            Assessment::Junk { .. } => {
                self.junk += 1;
            }
            Assessment::Assessed { outcome, .. } => match outcome.tier {
                Tier::Auto => {
                    self.auto += 1;
                    counts.auto += 1;
                }
                Tier::Pending => {
                    self.pending += 1;
                    counts.pending += 1;
                }
                Tier::None if !skipped => self.no_match += 1,
                Tier::None => {}
            },
        }
        if skipped {
            self.skipped += 1;
            counts.skipped += 1;
        }
    }

    pub fn record_new_product(&mut self, category: &str) {
        self.new_products += 1;
        self.per_category
            .entry(category.to_string())
            .or_default()
            .new_products += 1;
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# Soundcat Sync Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Dry run: {}\n- Items: {} total, {} completed, {} resumed\n- Candidates: {}\n- Auto-merged: {}\n- Pending review: {}\n- New products: {}\n- Skipped: {} ({} junk)\n- Link conflicts: {}\n- Errors: {} item, {} store\n- Anti-bot events: {}\n\n## Categories\n\n| category | auto | pending | new | skipped |\n|---|---|---|---|---|\n",
            self.run_id,
            self.started_at,
            self.finished_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.dry_run,
            self.items_total,
            self.items_completed,
            self.items_resumed,
            self.candidates,
            self.auto,
            self.pending,
            self.new_products,
            self.skipped,
            self.junk,
            self.conflicts,
            self.errors,
            self.store_errors,
            self.antibot_events,
        );
        for (category, c) in &self.per_category {
            out.push_str(&format!(
                "| {category} | {} | {} | {} | {} |\n",
                c.auto, c.pending, c.new_products, c.skipped
            ));
        }
        out
    }
}

/// Writes `run_summary.json` and `summary.md` under `reports/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("summary.md"), summary.to_markdown())
        .await
        .context("writing summary.md")?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_land_in_a_per_run_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut summary = RunSummary::new(Uuid::new_v4(), Utc::now(), false);
        summary.record_new_product("headphones");
        summary.record_assessment(
            "headphones",
            &Assessment::Junk {
                rule: "placeholder".into(),
            },
        );
        let dir = write_reports(tmp.path(), &summary).await.unwrap();
        assert!(dir.ends_with(summary.run_id.to_string()));

        let decoded: RunSummary =
            serde_json::from_slice(&std::fs::read(dir.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(decoded, summary);
        let md = std::fs::read_to_string(dir.join("summary.md")).unwrap();
        assert!(md.contains("| headphones | 0 | 0 | 1 | 1 |"));
    }
}
