//! Marketplace search-page scraping.

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use soundcat_core::{SourceCandidate, WorkItem};
use tracing::debug;
use url::Url;

use crate::{
    parse_price, text_or_none, AcquisitionSession, FetchedPage, SourceError, SourceFamily,
    SourceReader,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketplaceConfig {
    /// Search url with a `{query}` placeholder.
    pub search_url: String,
    #[serde(default)]
    pub selectors: ResultSelectors,
    /// Elements whose presence means the page is a challenge, not results.
    #[serde(default = "default_challenge_selectors")]
    pub challenge_selectors: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultSelectors {
    pub item: String,
    pub title: String,
    pub price: String,
    pub link: String,
    pub image: String,
    /// Attribute on the item element carrying the marketplace's listing id.
    pub id_attr: String,
    #[serde(default)]
    pub out_of_stock: Option<String>,
}

impl Default for ResultSelectors {
    fn default() -> Self {
        Self {
            item: "[data-listing-id]".to_string(),
            title: ".title".to_string(),
            price: ".price".to_string(),
            link: "a[href]".to_string(),
            image: "img[src]".to_string(),
            id_attr: "data-listing-id".to_string(),
            out_of_stock: Some(".sold-out".to_string()),
        }
    }
}

fn default_challenge_selectors() -> Vec<String> {
    vec![
        "form[action*='captcha']".to_string(),
        "#captcha".to_string(),
        "iframe[src*='challenge']".to_string(),
    ]
}

fn default_max_results() -> usize {
    48
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    price: Selector,
    link: Selector,
    image: Selector,
    out_of_stock: Option<Selector>,
    challenge: Vec<Selector>,
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("invalid selector {selector:?}: {e}"))
}

pub struct MarketplaceSearchReader {
    source_id: String,
    config: MarketplaceConfig,
    selectors: CompiledSelectors,
}

impl MarketplaceSearchReader {
    pub fn new(source_id: impl Into<String>, config: MarketplaceConfig) -> Result<Self> {
        let s = &config.selectors;
        let selectors = CompiledSelectors {
            item: compile(&s.item)?,
            title: compile(&s.title)?,
            price: compile(&s.price)?,
            link: compile(&s.link)?,
            image: compile(&s.image)?,
            out_of_stock: s.out_of_stock.as_deref().map(compile).transpose()?,
            challenge: config
                .challenge_selectors
                .iter()
                .map(|c| compile(c))
                .collect::<Result<Vec<_>>>()?,
        };
        Url::parse(&config.search_url.replace("{query}", "q"))
            .with_context(|| format!("invalid search_url {}", config.search_url))?;
        Ok(Self {
            source_id: source_id.into(),
            config,
            selectors,
        })
    }

    pub fn search_url(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.config.search_url.replace("{query}", &encoded)
    }

    pub fn parse_results(&self, page: &FetchedPage) -> Result<Vec<SourceCandidate>, SourceError> {
        let text = String::from_utf8_lossy(&page.body);
        let document = Html::parse_document(&text);

        if self
            .selectors
            .challenge
            .iter()
            .any(|sel| document.select(sel).next().is_some())
        {
            return Err(SourceError::AntiBot {
                source_id: self.source_id.clone(),
                url: page.url.clone(),
            });
        }

        let base = Url::parse(&page.url)
            .map_err(|e| SourceError::parse(&self.source_id, format!("page url {}: {e}", page.url)))?;

        let mut out = Vec::new();
        for element in document.select(&self.selectors.item) {
            if out.len() >= self.config.max_results {
                break;
            }
            if let Some(candidate) = self.candidate_from(element, &base) {
                out.push(candidate);
            }
        }
        debug!(source_id = %self.source_id, results = out.len(), "parsed marketplace results");
        Ok(out)
    }

    fn candidate_from(&self, element: ElementRef<'_>, base: &Url) -> Option<SourceCandidate> {
        let external_id = element
            .value()
            .attr(&self.config.selectors.id_attr)
            .and_then(text_or_none)?;
        let title = first_text(element, &self.selectors.title)?;
        let href = element
            .select(&self.selectors.link)
            .next()
            .and_then(|a| a.value().attr("href"))?;
        let url = base.join(href).ok()?.to_string();
        let price = first_text(element, &self.selectors.price).and_then(|t| parse_price(&t));
        let image_url = element
            .select(&self.selectors.image)
            .next()
            .and_then(|img| img.value().attr("src"))
            .and_then(|src| base.join(src).ok())
            .map(|u| u.to_string());
        let in_stock = match &self.selectors.out_of_stock {
            Some(sel) => element.select(sel).next().is_none(),
            None => true,
        };
        Some(SourceCandidate {
            external_id,
            title,
            price,
            in_stock,
            url,
            image_url,
            category_hint: element.value().attr("data-category").map(ToString::to_string),
        })
    }
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

#[async_trait]
impl SourceReader for MarketplaceSearchReader {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::MarketplaceSearch
    }

    async fn search(
        &self,
        session: &mut dyn AcquisitionSession,
        item: &WorkItem,
    ) -> Result<Vec<SourceCandidate>, SourceError> {
        let url = self.search_url(&item.query);
        let page = session.get(&self.source_id, &url).await?;
        self.parse_results(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_bytes, ScriptedSession};
    use std::collections::HashMap;

    fn reader() -> MarketplaceSearchReader {
        MarketplaceSearchReader::new(
            "market",
            MarketplaceConfig {
                search_url: "https://market.example/search?q={query}".into(),
                selectors: ResultSelectors::default(),
                challenge_selectors: default_challenge_selectors(),
                max_results: 48,
            },
        )
        .unwrap()
    }

    fn work_item(query: &str) -> WorkItem {
        WorkItem {
            id: format!("market:{query}"),
            source_id: "market".into(),
            query: query.into(),
            category: "headphones".into(),
            brand: None,
            priority: 0,
        }
    }

    #[test]
    fn search_url_encodes_the_query() {
        assert_eq!(
            reader().search_url("sennheiser hd 600"),
            "https://market.example/search?q=sennheiser+hd+600"
        );
    }

    #[tokio::test]
    async fn parses_result_cards_into_candidates() {
        let reader = reader();
        let url = reader.search_url("sennheiser hd600");
        let mut session = ScriptedSession {
            pages: HashMap::from([(url.clone(), fixture_bytes("marketplace/search_hd600.html"))]),
            requested: Vec::new(),
        };
        let results = reader
            .search(&mut session, &work_item("sennheiser hd600"))
            .await
            .unwrap();
        assert_eq!(session.requested, vec![url]);
        assert_eq!(results.len(), 3);

        let first = &results[0];
        assert_eq!(first.external_id, "m-1001");
        assert_eq!(first.title, "Sennheiser HD600 Open Back Headphones");
        assert_eq!(first.price, Some(299.0));
        assert!(first.in_stock);
        assert_eq!(first.url, "https://market.example/item/m-1001");
        assert_eq!(
            first.image_url.as_deref(),
            Some("https://market.example/img/m-1001.jpg")
        );

        let sold_out = &results[2];
        assert_eq!(sold_out.external_id, "m-1003");
        assert!(!sold_out.in_stock);
        assert_eq!(sold_out.category_hint.as_deref(), Some("accessories"));
    }

    #[test]
    fn challenge_pages_are_anti_bot_errors() {
        let reader = reader();
        let page = FetchedPage {
            url: "https://market.example/search?q=x".into(),
            content_type: "text/html".into(),
            body: fixture_bytes("marketplace/challenge.html"),
            fetched_at: chrono::Utc::now(),
        };
        assert!(reader.parse_results(&page).unwrap_err().is_anti_bot());
    }
}
