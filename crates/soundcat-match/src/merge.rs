//! Write-time dedup and the conflict-aware merge plan.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use soundcat_core::{
    CanonicalProduct, CommercialUpdate, ExternalListing, ListingKey, MatchCandidate, MatchOutcome,
    ProductProposal, ReviewPayload, ReviewTask, ReviewTaskType, Tier,
};
use uuid::Uuid;

/// Keeps the highest-ranked outcome (tier, then score) per listing key.
/// Earlier outcomes win exact ties.
pub fn dedup_outcomes(outcomes: Vec<MatchOutcome>) -> Vec<MatchOutcome> {
    let mut best: BTreeMap<ListingKey, MatchOutcome> = BTreeMap::new();
    for outcome in outcomes {
        match best.get(&outcome.key) {
            Some(current) if !outcome.outranks(current) => {}
            _ => {
                best.insert(outcome.key.clone(), outcome);
            }
        }
    }
    best.into_values().collect()
}

/// Deterministic id for a product created from a proposal.
pub fn proposed_product_id(proposal: &ProductProposal) -> String {
    let name = format!("{}:{}", proposal.category, proposal.normalized_name);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Rows to write for one flush, grouped by entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub new_products: Vec<CanonicalProduct>,
    pub listings: Vec<ExternalListing>,
    pub commercial: Vec<CommercialUpdate>,
    pub review_tasks: Vec<ReviewTask>,
    pub conflicts: usize,
    /// Canonical products whose best-offer fields need recomputing.
    pub touched_products: BTreeSet<String>,
}

impl MergePlan {
    /// Candidates to append to the index once the products are stored.
    pub fn new_candidates(&self) -> Vec<MatchCandidate> {
        self.new_products.iter().map(MatchCandidate::from).collect()
    }
}

fn listing_ref(key: &ListingKey) -> String {
    key.to_string()
}

fn payload(outcome: &MatchOutcome, current: Option<&str>) -> ReviewPayload {
    ReviewPayload {
        retailer_id: Some(outcome.key.retailer_id.clone()),
        external_id: Some(outcome.key.external_id.clone()),
        listing_title: outcome.observation.title.clone(),
        suggested_product_id: outcome.candidate_id.clone(),
        suggested_product_name: outcome.candidate_name.clone(),
        current_product_id: current.map(str::to_string),
        score: outcome.score,
        scope: outcome.scope,
        detected_category: None,
    }
}

fn match_review(outcome: &MatchOutcome) -> ReviewTask {
    ReviewTask::open(
        ReviewTaskType::MatchReview,
        listing_ref(&outcome.key),
        outcome.score,
        payload(outcome, None),
        format!(
            "probable match to {} ({:.3})",
            outcome.candidate_name.as_deref().unwrap_or("unknown"),
            outcome.score.unwrap_or(0.0)
        ),
    )
}

fn link_conflict(outcome: &MatchOutcome, current: &str) -> ReviewTask {
    ReviewTask::open(
        ReviewTaskType::LinkConflict,
        listing_ref(&outcome.key),
        outcome.score,
        payload(outcome, Some(current)),
        format!(
            "auto match suggests {} but listing is linked to {current}",
            outcome.candidate_id.as_deref().unwrap_or("unknown")
        ),
    )
}

/// Partitions deduplicated outcomes into write groups.
///
/// `existing` maps every already-stored listing among the outcomes to its
/// current canonical link. A set link is never replaced: an auto decision
/// pointing elsewhere only refreshes commercial fields and raises a
/// `link_conflict` task.
pub fn plan_merge(
    outcomes: Vec<MatchOutcome>,
    existing: &BTreeMap<ListingKey, Option<String>>,
    now: DateTime<Utc>,
) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut created: BTreeMap<(String, String), String> = BTreeMap::new();

    for outcome in dedup_outcomes(outcomes) {
        let key = outcome.key.clone();
        match existing.get(&key) {
            Some(Some(current)) => {
                plan.commercial
                    .push(CommercialUpdate::from_observation(&key, &outcome.observation));
                plan.touched_products.insert(current.clone());
                let suggested = outcome.candidate_id.as_deref();
                if outcome.tier == Tier::Auto && suggested.is_some_and(|s| s != current.as_str()) {
                    plan.review_tasks.push(link_conflict(&outcome, current));
                    plan.conflicts += 1;
                }
            }
            stored => {
                let link = match (outcome.tier, &outcome.proposal) {
                    (Tier::Auto, _) => outcome.candidate_id.clone(),
                    (Tier::Pending, _) => {
                        plan.review_tasks.push(match_review(&outcome));
                        None
                    }
                    (Tier::None, Some(proposal)) => {
                        let group = (proposal.category.clone(), proposal.normalized_name.clone());
                        let id = created
                            .entry(group)
                            .or_insert_with(|| {
                                let id = proposed_product_id(proposal);
                                plan.new_products.push(CanonicalProduct {
                                    id: id.clone(),
                                    name: proposal.name.clone(),
                                    brand: proposal.brand.clone(),
                                    category: proposal.category.clone(),
                                    lowest_price: None,
                                    in_stock: false,
                                    image_url: None,
                                    updated_at: now,
                                });
                                id
                            })
                            .clone();
                        Some(id)
                    }
                    (Tier::None, None) => {
                        // Unlinked row already stored: refresh it, otherwise nothing to write.
                        if stored.is_some() {
                            plan.commercial
                                .push(CommercialUpdate::from_observation(&key, &outcome.observation));
                        }
                        continue;
                    }
                };
                if let Some(id) = &link {
                    plan.touched_products.insert(id.clone());
                }
                plan.listings
                    .push(ExternalListing::from_observation(&key, link, &outcome.observation));
            }
        }
    }
    plan
}
