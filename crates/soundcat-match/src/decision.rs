//! Three-tier threshold classification.

use serde::{Deserialize, Serialize};
use soundcat_core::{IndexScope, Tier};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub auto: f64,
    pub pending: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("{scope:?} thresholds: auto {auto} must exceed pending {pending}")]
    Inverted {
        scope: IndexScope,
        auto: f64,
        pending: f64,
    },
    #[error("{scope:?} threshold {value} is outside [0, 1]")]
    OutOfRange { scope: IndexScope, value: f64 },
    #[error("category-scoped thresholds must be at least the brand-scoped ones")]
    CategoryLooserThanBrand,
}

/// Thresholds per index granularity. The category-wide index is less precise,
/// so its bar is never lower than the brand-scoped one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub brand: Thresholds,
    pub category: Thresholds,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            brand: Thresholds {
                auto: 0.85,
                pending: 0.65,
            },
            category: Thresholds {
                auto: 0.92,
                pending: 0.75,
            },
        }
    }
}

impl DecisionPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (scope, t) in [(IndexScope::Brand, self.brand), (IndexScope::Category, self.category)] {
            for value in [t.auto, t.pending] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(PolicyError::OutOfRange { scope, value });
                }
            }
            if t.auto <= t.pending {
                return Err(PolicyError::Inverted {
                    scope,
                    auto: t.auto,
                    pending: t.pending,
                });
            }
        }
        if self.category.auto < self.brand.auto || self.category.pending < self.brand.pending {
            return Err(PolicyError::CategoryLooserThanBrand);
        }
        Ok(())
    }

    pub fn thresholds(&self, scope: IndexScope) -> Thresholds {
        match scope {
            IndexScope::Brand => self.brand,
            IndexScope::Category => self.category,
        }
    }

    /// A score over the auto bar without brand containment drops to review.
    pub fn classify(
        &self,
        score: f64,
        scope: IndexScope,
        cross_category: bool,
        brand_containment: bool,
    ) -> Tier {
        if cross_category || !score.is_finite() {
            return Tier::None;
        }
        let t = self.thresholds(scope);
        if score >= t.auto && brand_containment {
            Tier::Auto
        } else if score >= t.pending {
            Tier::Pending
        } else {
            Tier::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = DecisionPolicy::default();
        policy.validate().unwrap();
        for scope in [IndexScope::Brand, IndexScope::Category] {
            let t = policy.thresholds(scope);
            assert!(t.auto > t.pending);
        }
        assert!(policy.category.auto >= policy.brand.auto);
        assert!(policy.category.pending >= policy.brand.pending);
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let mut inverted = DecisionPolicy::default();
        inverted.brand.pending = 0.9;
        assert!(matches!(inverted.validate(), Err(PolicyError::Inverted { .. })));

        let mut looser = DecisionPolicy::default();
        looser.category.auto = 0.80;
        assert_eq!(looser.validate(), Err(PolicyError::CategoryLooserThanBrand));

        let mut range = DecisionPolicy::default();
        range.category.auto = 1.5;
        assert!(matches!(range.validate(), Err(PolicyError::OutOfRange { .. })));
    }

    #[test]
    fn tiers_follow_scope_thresholds() {
        let p = DecisionPolicy::default();
        assert_eq!(p.classify(0.86, IndexScope::Brand, false, true), Tier::Auto);
        assert_eq!(p.classify(0.86, IndexScope::Category, false, true), Tier::Pending);
        assert_eq!(p.classify(0.70, IndexScope::Brand, false, true), Tier::Pending);
        assert_eq!(p.classify(0.70, IndexScope::Category, false, true), Tier::None);
        assert_eq!(p.classify(0.95, IndexScope::Category, false, true), Tier::Auto);
    }

    #[test]
    fn cross_category_never_yields_a_decision() {
        let p = DecisionPolicy::default();
        assert_eq!(p.classify(1.0, IndexScope::Brand, true, true), Tier::None);
        assert_eq!(p.classify(0.7, IndexScope::Brand, true, true), Tier::None);
    }

    #[test]
    fn auto_requires_brand_containment() {
        let p = DecisionPolicy::default();
        assert_eq!(p.classify(0.99, IndexScope::Brand, false, false), Tier::Pending);
    }
}
