//! Core catalog domain model shared by the soundcat crates.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "soundcat-core";

/// The single deduplicated catalog entry for one physical SKU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: String,
    pub lowest_price: Option<f64>,
    pub in_stock: bool,
    pub image_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Scoring projection of a [`CanonicalProduct`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: String,
}

impl From<&CanonicalProduct> for MatchCandidate {
    fn from(product: &CanonicalProduct) -> Self {
        Self {
            id: product.id.clone(),
            name: product.name.clone(),
            brand: product.brand.clone(),
            category: product.category.clone(),
        }
    }
}

/// Natural business key of an external listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub retailer_id: String,
    pub external_id: String,
}

impl ListingKey {
    pub fn new(retailer_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            retailer_id: retailer_id.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.retailer_id, self.external_id)
    }
}

/// Uniform shape every source reader returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub in_stock: bool,
    pub url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub category_hint: Option<String>,
}

/// One unit of acquisition work: a query (or collection ref) against one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub source_id: String,
    pub query: String,
    pub category: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Auto,
    Pending,
    None,
}

impl Tier {
    pub fn rank(self) -> u8 {
        match self {
            Tier::Auto => 2,
            Tier::Pending => 1,
            Tier::None => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Auto => "auto",
            Tier::Pending => "pending",
            Tier::None => "none",
        }
    }
}

/// Granularity of the candidate index a score was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScope {
    Brand,
    Category,
}

/// Commercial fields observed for a listing during acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingObservation {
    pub title: String,
    pub price: Option<f64>,
    pub in_stock: bool,
    pub url: String,
    pub image_url: Option<String>,
    pub content_key: String,
    pub observed_at: DateTime<Utc>,
}

/// A new canonical product suggested by a no-match outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductProposal {
    pub name: String,
    pub brand: Option<String>,
    pub category: String,
    pub normalized_name: String,
}

/// Per-item matching result, buffered until the next flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub key: ListingKey,
    pub category: String,
    pub candidate_id: Option<String>,
    pub candidate_name: Option<String>,
    pub score: Option<f64>,
    pub tier: Tier,
    pub scope: Option<IndexScope>,
    pub observation: ListingObservation,
    pub proposal: Option<ProductProposal>,
}

impl MatchOutcome {
    /// Ordering used by write-time dedup: tier first, then score.
    pub fn outranks(&self, other: &MatchOutcome) -> bool {
        let (a, b) = (self.tier.rank(), other.tier.rank());
        if a != b {
            return a > b;
        }
        self.score.unwrap_or(0.0) > other.score.unwrap_or(0.0)
    }
}

/// Retailer-specific observation of a product, persisted once per [`ListingKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalListing {
    pub retailer_id: String,
    pub external_id: String,
    pub canonical_product_id: Option<String>,
    pub title: String,
    pub price: Option<f64>,
    pub in_stock: bool,
    pub url: String,
    pub image_url: Option<String>,
    pub content_key: String,
    pub last_checked: DateTime<Utc>,
}

impl ExternalListing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.retailer_id.clone(), self.external_id.clone())
    }

    pub fn from_observation(
        key: &ListingKey,
        canonical_product_id: Option<String>,
        observation: &ListingObservation,
    ) -> Self {
        Self {
            retailer_id: key.retailer_id.clone(),
            external_id: key.external_id.clone(),
            canonical_product_id,
            title: observation.title.clone(),
            price: observation.price,
            in_stock: observation.in_stock,
            url: observation.url.clone(),
            image_url: observation.image_url.clone(),
            content_key: observation.content_key.clone(),
            last_checked: observation.observed_at,
        }
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        require_non_empty("external_listing", "retailer_id", &self.retailer_id)?;
        require_non_empty("external_listing", "external_id", &self.external_id)?;
        require_non_empty("external_listing", "url", &self.url)?;
        require_price("external_listing", self.price)
    }
}

/// Price/stock/url/image refresh that never touches the canonical link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommercialUpdate {
    pub key: ListingKey,
    pub title: String,
    pub price: Option<f64>,
    pub in_stock: bool,
    pub url: String,
    pub image_url: Option<String>,
    pub last_checked: DateTime<Utc>,
}

impl CommercialUpdate {
    pub fn from_observation(key: &ListingKey, observation: &ListingObservation) -> Self {
        Self {
            key: key.clone(),
            title: observation.title.clone(),
            price: observation.price,
            in_stock: observation.in_stock,
            url: observation.url.clone(),
            image_url: observation.image_url.clone(),
            last_checked: observation.observed_at,
        }
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        require_non_empty("commercial_update", "external_id", &self.key.external_id)?;
        require_non_empty("commercial_update", "url", &self.url)?;
        require_price("commercial_update", self.price)
    }
}

impl CanonicalProduct {
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        require_non_empty("canonical_product", "id", &self.id)?;
        require_non_empty("canonical_product", "name", &self.name)?;
        require_non_empty("canonical_product", "category", &self.category)?;
        require_price("canonical_product", self.lowest_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewTaskType {
    MatchReview,
    LinkConflict,
    CategoryAudit,
}

impl ReviewTaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewTaskType::MatchReview => "match_review",
            ReviewTaskType::LinkConflict => "link_conflict",
            ReviewTaskType::CategoryAudit => "category_audit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "match_review" => Some(ReviewTaskType::MatchReview),
            "link_conflict" => Some(ReviewTaskType::LinkConflict),
            "category_audit" => Some(ReviewTaskType::CategoryAudit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Open,
    Resolved,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Open => "open",
            ReviewStatus::Resolved => "resolved",
        }
    }
}

/// Evidence attached to a review task for the human reviewer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub retailer_id: Option<String>,
    pub external_id: Option<String>,
    pub listing_title: String,
    pub suggested_product_id: Option<String>,
    pub suggested_product_name: Option<String>,
    pub current_product_id: Option<String>,
    pub score: Option<f64>,
    pub scope: Option<IndexScope>,
    pub detected_category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTask {
    pub id: Uuid,
    pub task_type: ReviewTaskType,
    pub source_listing_id: String,
    pub priority: i32,
    pub payload: ReviewPayload,
    pub status: ReviewStatus,
    pub reason_text: String,
    pub created_at: DateTime<Utc>,
}

impl ReviewTask {
    /// Builds an open task whose id is derived from `(task_type, source_listing_id)`,
    /// so re-processing the same listing yields the same task.
    pub fn open(
        task_type: ReviewTaskType,
        source_listing_id: impl Into<String>,
        score: Option<f64>,
        payload: ReviewPayload,
        reason_text: impl Into<String>,
    ) -> Self {
        let source_listing_id = source_listing_id.into();
        Self {
            id: review_task_id(task_type, &source_listing_id),
            task_type,
            source_listing_id,
            priority: score.map(priority_for_score).unwrap_or(0),
            payload,
            status: ReviewStatus::Open,
            reason_text: reason_text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        require_non_empty("review_task", "source_listing_id", &self.source_listing_id)?;
        require_non_empty("review_task", "reason_text", &self.reason_text)
    }
}

pub fn review_task_id(task_type: ReviewTaskType, source_listing_id: &str) -> Uuid {
    let name = format!("{}:{}", task_type.as_str(), source_listing_id);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

/// Maps a match score in `[0, 1]` onto a 0..=100 review priority.
pub fn priority_for_score(score: f64) -> i32 {
    if !score.is_finite() {
        return 0;
    }
    (score.clamp(0.0, 1.0) * 100.0).round() as i32
}

/// Durable record of completed work items for resumable runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_ids: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            completed_ids: BTreeSet::new(),
            started_at,
            last_updated: started_at,
        }
    }
}

/// A record missing a required field (or carrying an impossible value) at write time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity}.{field}: {detail}")]
pub struct InvariantViolation {
    pub entity: &'static str,
    pub field: &'static str,
    pub detail: String,
}

fn require_non_empty(
    entity: &'static str,
    field: &'static str,
    value: &str,
) -> Result<(), InvariantViolation> {
    if value.trim().is_empty() {
        return Err(InvariantViolation {
            entity,
            field,
            detail: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn require_price(entity: &'static str, price: Option<f64>) -> Result<(), InvariantViolation> {
    match price {
        Some(p) if !p.is_finite() || p < 0.0 => Err(InvariantViolation {
            entity,
            field: "price",
            detail: format!("invalid price {p}"),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> ListingObservation {
        ListingObservation {
            title: "Sennheiser HD 600".into(),
            price: Some(299.0),
            in_stock: true,
            url: "https://shop.example/hd600".into(),
            image_url: None,
            content_key: "k".into(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn review_task_ids_are_stable_per_type_and_listing() {
        let a = ReviewTask::open(
            ReviewTaskType::LinkConflict,
            "shop:X",
            Some(0.9),
            ReviewPayload::default(),
            "conflict",
        );
        let b = ReviewTask::open(
            ReviewTaskType::LinkConflict,
            "shop:X",
            Some(0.5),
            ReviewPayload::default(),
            "conflict again",
        );
        let c = ReviewTask::open(
            ReviewTaskType::MatchReview,
            "shop:X",
            Some(0.9),
            ReviewPayload::default(),
            "pending",
        );
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.priority, 90);
    }

    #[test]
    fn review_tasks_key_ordered_maps_by_type_and_listing() {
        let mut tasks = std::collections::BTreeMap::new();
        tasks.insert((ReviewTaskType::CategoryAudit, "p1".to_string()), 1);
        tasks.insert((ReviewTaskType::MatchReview, "shop:X".to_string()), 2);
        tasks.insert((ReviewTaskType::MatchReview, "shop:X".to_string()), 3);
        assert_eq!(tasks.len(), 2);
        assert!(ReviewTaskType::MatchReview < ReviewTaskType::CategoryAudit);
    }

    #[test]
    fn outcome_rank_prefers_tier_then_score() {
        let key = ListingKey::new("shop", "X");
        let base = MatchOutcome {
            key,
            category: "headphones".into(),
            candidate_id: Some("c1".into()),
            candidate_name: None,
            score: Some(0.9),
            tier: Tier::Auto,
            scope: Some(IndexScope::Brand),
            observation: observation(),
            proposal: None,
        };
        let pending = MatchOutcome {
            score: Some(0.99),
            tier: Tier::Pending,
            ..base.clone()
        };
        let weaker_auto = MatchOutcome {
            score: Some(0.86),
            ..base.clone()
        };
        assert!(base.outranks(&pending));
        assert!(!pending.outranks(&base));
        assert!(base.outranks(&weaker_auto));
    }

    #[test]
    fn listing_validation_rejects_missing_fields_and_bad_prices() {
        let key = ListingKey::new("shop", "");
        let listing = ExternalListing::from_observation(&key, None, &observation());
        let err = listing.validate().unwrap_err();
        assert_eq!(err.field, "external_id");

        let key = ListingKey::new("shop", "X");
        let mut obs = observation();
        obs.price = Some(-1.0);
        let listing = ExternalListing::from_observation(&key, None, &obs);
        assert_eq!(listing.validate().unwrap_err().field, "price");
    }
}
