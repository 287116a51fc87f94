//! Offline reader serving recorded search results from a JSON bundle.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use soundcat_core::{SourceCandidate, WorkItem};

use crate::{AcquisitionSession, SourceError, SourceFamily, SourceReader};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FixtureConfig {
    /// Bundle path, relative to the workspace root.
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct FixtureBundle {
    #[serde(default)]
    queries: BTreeMap<String, Vec<SourceCandidate>>,
    /// Queries that answer with an anti-bot challenge.
    #[serde(default)]
    challenged: BTreeSet<String>,
}

#[derive(Debug)]
pub struct FixtureReader {
    source_id: String,
    bundle: FixtureBundle,
}

impl FixtureReader {
    pub fn load(source_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture bundle {}", path.display()))?;
        let bundle: FixtureBundle = serde_json::from_str(&raw)
            .with_context(|| format!("parsing fixture bundle {}", path.display()))?;
        Ok(Self {
            source_id: source_id.into(),
            bundle,
        })
    }

    pub fn queries(&self) -> impl Iterator<Item = &str> {
        self.bundle.queries.keys().map(String::as_str)
    }
}

#[async_trait]
impl SourceReader for FixtureReader {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Fixture
    }

    async fn search(
        &self,
        _session: &mut dyn AcquisitionSession,
        item: &WorkItem,
    ) -> Result<Vec<SourceCandidate>, SourceError> {
        if self.bundle.challenged.contains(&item.query) {
            return Err(SourceError::AntiBot {
                source_id: self.source_id.clone(),
                url: format!("fixture://{}/{}", self.source_id, item.query),
            });
        }
        Ok(self
            .bundle
            .queries
            .get(&item.query)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::workspace_root;
    use crate::OfflineSessionFactory;
    use crate::SessionFactory;

    fn item(query: &str) -> WorkItem {
        WorkItem {
            id: format!("offline:{query}"),
            source_id: "offline".into(),
            query: query.into(),
            category: "headphones".into(),
            brand: Some("Sennheiser".into()),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn serves_recorded_results_and_challenges() {
        let reader = FixtureReader::load(
            "offline",
            workspace_root().join("fixtures/offline/catalog.json"),
        )
        .unwrap();
        let mut session = OfflineSessionFactory.open(0).await.unwrap();

        let results = reader
            .search(session.as_mut(), &item("sennheiser hd600"))
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().any(|c| c.title.contains("HD600")));

        let unknown = reader
            .search(session.as_mut(), &item("nothing recorded"))
            .await
            .unwrap();
        assert!(unknown.is_empty());

        let blocked = reader
            .search(session.as_mut(), &item("blocked query"))
            .await
            .unwrap_err();
        assert!(blocked.is_anti_bot());
    }

    #[test]
    fn missing_bundle_is_an_error() {
        assert!(FixtureReader::load("offline", "/nonexistent/bundle.json").is_err());
    }
}
