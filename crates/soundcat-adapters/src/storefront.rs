//! Storefront collection feeds (`/collections/<handle>/products.json`).

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use soundcat_core::{SourceCandidate, WorkItem};
use tracing::debug;

use crate::{AcquisitionSession, FetchedPage, SourceError, SourceFamily, SourceReader};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorefrontConfig {
    pub base_url: String,
    /// Collection handles keyed by work-item query. Unmapped queries are slugged.
    #[serde(default)]
    pub collections: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default)]
    products: Vec<FeedProduct>,
}

#[derive(Debug, Deserialize)]
struct FeedProduct {
    id: serde_json::Value,
    title: String,
    handle: String,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    product_type: Option<String>,
    #[serde(default)]
    variants: Vec<FeedVariant>,
    #[serde(default)]
    images: Vec<FeedImage>,
}

#[derive(Debug, Deserialize)]
struct FeedVariant {
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct FeedImage {
    src: String,
}

pub struct StorefrontFeedReader {
    source_id: String,
    config: StorefrontConfig,
}

impl StorefrontFeedReader {
    pub fn new(source_id: impl Into<String>, config: StorefrontConfig) -> Self {
        Self {
            source_id: source_id.into(),
            config,
        }
    }

    pub fn feed_url(&self, query: &str) -> String {
        let handle = self
            .config
            .collections
            .get(query)
            .cloned()
            .unwrap_or_else(|| slug(query));
        format!(
            "{}/collections/{}/products.json",
            self.config.base_url.trim_end_matches('/'),
            handle
        )
    }

    pub fn parse_feed(&self, page: &FetchedPage) -> Result<Vec<SourceCandidate>, SourceError> {
        let feed: Feed = serde_json::from_slice(&page.body)
            .map_err(|e| SourceError::parse(&self.source_id, format!("{}: {e}", page.url)))?;
        let base = self.config.base_url.trim_end_matches('/');

        let out: Vec<SourceCandidate> = feed
            .products
            .into_iter()
            .map(|product| {
                let external_id = match &product.id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let in_stock = product.variants.iter().any(|v| v.available);
                // Cheapest purchasable variant, falling back to the cheapest listed one.
                let pick = |only_available: bool| {
                    product
                        .variants
                        .iter()
                        .filter(|v| !only_available || v.available)
                        .filter_map(|v| v.price.as_deref().and_then(crate::parse_price))
                        .min_by(|a, b| a.total_cmp(b))
                };
                let price = pick(true).or_else(|| pick(false));
                let title = match &product.vendor {
                    Some(vendor)
                        if !product.title.to_lowercase().contains(&vendor.to_lowercase()) =>
                    {
                        format!("{vendor} {}", product.title)
                    }
                    _ => product.title.clone(),
                };
                SourceCandidate {
                    external_id,
                    title,
                    price,
                    in_stock,
                    url: format!("{base}/products/{}", product.handle),
                    image_url: product.images.first().map(|i| i.src.clone()),
                    category_hint: product.product_type.filter(|t| !t.trim().is_empty()),
                }
            })
            .collect();
        debug!(source_id = %self.source_id, results = out.len(), "parsed storefront feed");
        Ok(out)
    }
}

fn slug(query: &str) -> String {
    query
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[async_trait]
impl SourceReader for StorefrontFeedReader {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::StorefrontFeed
    }

    async fn search(
        &self,
        session: &mut dyn AcquisitionSession,
        item: &WorkItem,
    ) -> Result<Vec<SourceCandidate>, SourceError> {
        let url = self.feed_url(&item.query);
        let page = session.get(&self.source_id, &url).await?;
        self.parse_feed(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_bytes, ScriptedSession};
    use std::collections::{BTreeMap, HashMap};

    fn reader() -> StorefrontFeedReader {
        StorefrontFeedReader::new(
            "hifi-shop",
            StorefrontConfig {
                base_url: "https://hifi-shop.example/".into(),
                collections: BTreeMap::from([("open back headphones".into(), "open-back".into())]),
            },
        )
    }

    #[test]
    fn feed_urls_use_mapped_collection_or_slug() {
        let reader = reader();
        assert_eq!(
            reader.feed_url("open back headphones"),
            "https://hifi-shop.example/collections/open-back/products.json"
        );
        assert_eq!(
            reader.feed_url("Studio Monitors"),
            "https://hifi-shop.example/collections/studio-monitors/products.json"
        );
    }

    #[tokio::test]
    async fn feed_products_become_candidates() {
        let reader = reader();
        let url = reader.feed_url("open back headphones");
        let mut session = ScriptedSession {
            pages: HashMap::from([(url, fixture_bytes("storefront/open-back.json"))]),
            requested: Vec::new(),
        };
        let item = WorkItem {
            id: "hifi-shop:open back headphones".into(),
            source_id: "hifi-shop".into(),
            query: "open back headphones".into(),
            category: "headphones".into(),
            brand: None,
            priority: 0,
        };
        let results = reader.search(&mut session, &item).await.unwrap();
        assert_eq!(results.len(), 2);

        let hd600 = &results[0];
        assert_eq!(hd600.external_id, "7001");
        assert_eq!(hd600.title, "Sennheiser HD 600");
        assert_eq!(hd600.price, Some(329.0));
        assert!(hd600.in_stock);
        assert_eq!(hd600.url, "https://hifi-shop.example/products/sennheiser-hd-600");

        // Vendor prefixed; all variants sold out so the cheapest listed price is used.
        let dt990 = &results[1];
        assert_eq!(dt990.title, "Beyerdynamic DT 990 Pro 250 Ohm");
        assert!(!dt990.in_stock);
        assert_eq!(dt990.price, Some(159.0));
        assert_eq!(dt990.category_hint.as_deref(), Some("Headphones"));
    }

    #[test]
    fn malformed_feeds_are_parse_errors() {
        let page = FetchedPage {
            url: "https://hifi-shop.example/collections/x/products.json".into(),
            content_type: "application/json".into(),
            body: b"<html>".to_vec(),
            fetched_at: chrono::Utc::now(),
        };
        assert!(matches!(
            reader().parse_feed(&page),
            Err(SourceError::Parse { .. })
        ));
    }
}
