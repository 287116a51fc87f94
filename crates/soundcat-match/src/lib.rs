//! Matching and reconciliation engine: normalizer, candidate index, matcher,
//! guards, decision policy, and the conflict-aware merge planner.

pub mod decision;
pub mod guards;
pub mod index;
pub mod matcher;
pub mod merge;
pub mod normalize;
pub mod reconcile;

pub use decision::{DecisionPolicy, PolicyError, Thresholds};
pub use guards::{
    audit_misclassified, BrandEntry, BrandTable, CategoryRule, CategorySignal, GuardRules,
    JunkPredicate, JunkRule, Misclassification, RuleTableGuards,
};
pub use index::{CandidateIndex, CatalogIndex, IndexedCandidate};
pub use matcher::{find_best_match, find_best_prepared, text_similarity, BestMatch, PreparedQuery};
pub use merge::{dedup_outcomes, plan_merge, proposed_product_id, MergePlan};
pub use normalize::{content_key, normalize};
pub use reconcile::{Assessment, Reconciler};

pub const CRATE_NAME: &str = "soundcat-match";
