//! Per-item pipeline: guards, matcher, then the decision policy.

use chrono::{DateTime, Utc};
use soundcat_core::{
    ListingKey, ListingObservation, MatchOutcome, ProductProposal, SourceCandidate, Tier, WorkItem,
};

use crate::decision::DecisionPolicy;
use crate::guards::{BrandTable, CategorySignal, GuardRules, JunkPredicate, RuleTableGuards};
use crate::index::CatalogIndex;
use crate::matcher::find_best_match;
use crate::normalize::{content_key, normalize};

#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// Rejected before scoring.
    Junk { rule: String },
    Assessed {
        outcome: MatchOutcome,
        /// The winning candidate sat in another category and was discarded.
        cross_category: bool,
    },
}

impl Assessment {
    /// Skipped items produce no match and no new product.
    pub fn is_skipped(&self) -> bool {
        match self {
            Assessment::Junk { .. } => true,
            Assessment::Assessed {
                outcome,
                cross_category,
            } => *cross_category || (outcome.tier == Tier::None && outcome.proposal.is_none()),
        }
    }
}

pub struct Reconciler {
    policy: DecisionPolicy,
    junk: Vec<Box<dyn JunkPredicate>>,
    signals: Vec<Box<dyn CategorySignal>>,
    brands: BrandTable,
    create_products: bool,
}

impl Reconciler {
    pub fn new(policy: DecisionPolicy, rules: &GuardRules) -> Self {
        let guards = RuleTableGuards::new(rules);
        Self {
            policy,
            junk: vec![Box::new(guards.clone())],
            signals: vec![Box::new(guards)],
            brands: BrandTable::new(&rules.brands),
            create_products: true,
        }
    }

    pub fn with_create_products(mut self, enabled: bool) -> Self {
        self.create_products = enabled;
        self
    }

    pub fn with_junk_predicate(mut self, predicate: Box<dyn JunkPredicate>) -> Self {
        self.junk.push(predicate);
        self
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn resolve_brand(&self, item: &WorkItem, title: &str) -> Option<String> {
        item.brand
            .clone()
            .or_else(|| self.brands.resolve(title).map(str::to_string))
    }

    pub fn assess(
        &self,
        index: &CatalogIndex,
        item: &WorkItem,
        candidate: &SourceCandidate,
        observed_at: DateTime<Utc>,
    ) -> Assessment {
        if let Some(rule) = self.junk.iter().find_map(|j| j.junk_rule(&candidate.title)) {
            return Assessment::Junk {
                rule: rule.to_string(),
            };
        }

        let signal_text = match &candidate.category_hint {
            Some(hint) => format!("{} {hint}", candidate.title),
            None => candidate.title.clone(),
        };
        let expected_category = self
            .signals
            .iter()
            .find_map(|s| s.detect_category(&signal_text, &item.category))
            .unwrap_or(item.category.as_str())
            .to_string();

        let brand = self.resolve_brand(item, &candidate.title);
        let title = collapse_whitespace(&candidate.title);
        let observation = ListingObservation {
            title: title.clone(),
            price: candidate.price,
            in_stock: candidate.in_stock,
            url: candidate.url.clone(),
            image_url: candidate.image_url.clone(),
            content_key: content_key(&item.source_id, &candidate.title),
            observed_at,
        };
        let mut outcome = MatchOutcome {
            key: ListingKey::new(item.source_id.clone(), candidate.external_id.clone()),
            category: expected_category.clone(),
            candidate_id: None,
            candidate_name: None,
            score: None,
            tier: Tier::None,
            scope: None,
            observation,
            proposal: None,
        };

        let mut cross_category = false;
        let scoped = index.scoped(&expected_category, brand.as_deref());
        if let Some((scope, sub)) = scoped {
            if let Some(best) = find_best_match(&candidate.title, sub, brand.as_deref()) {
                cross_category = best.category != expected_category;
                outcome.scope = Some(scope);
                outcome.score = Some(best.score);
                outcome.tier =
                    self.policy
                        .classify(best.score, scope, cross_category, best.brand_containment);
                if !cross_category {
                    outcome.candidate_id = Some(best.id);
                    outcome.candidate_name = Some(best.name);
                }
            }
        }

        if outcome.tier == Tier::None && !cross_category && self.create_products {
            let normalized_name = normalize(&title);
            if !normalized_name.is_empty() && !expected_category.trim().is_empty() {
                outcome.proposal = Some(ProductProposal {
                    name: title,
                    brand,
                    category: expected_category,
                    normalized_name,
                });
            }
        }

        Assessment::Assessed {
            outcome,
            cross_category,
        }
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
