//! Rule-table guards: junk rejection, category signals, brand lookup.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use soundcat_core::CanonicalProduct;

use crate::normalize::{contains_phrase, normalize};

/// Rejects listings that are not real products.
pub trait JunkPredicate: Send + Sync {
    /// Name of the matching rule, if the title is junk.
    fn junk_rule(&self, title: &str) -> Option<&str>;
}

/// Detects title signals that contradict an assigned category.
pub trait CategorySignal: Send + Sync {
    /// The category the text points to, when it differs from `assigned`.
    fn detect_category(&self, text: &str, assigned: &str) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunkRule {
    pub rule: String,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    /// Assigned categories this rule may override; empty means any.
    #[serde(default)]
    pub applies_to: Vec<String>,
    pub contains_any: Vec<String>,
    /// Phrases that cancel the rule ("headphones with case" stays headphones).
    #[serde(default)]
    pub unless_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Contents of `rules/guards.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardRules {
    pub version: u32,
    #[serde(default)]
    pub junk: Vec<JunkRule>,
    #[serde(default)]
    pub category_overrides: Vec<CategoryRule>,
    #[serde(default)]
    pub brands: Vec<BrandEntry>,
}

fn phrases(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for GuardRules {
    fn default() -> Self {
        Self {
            version: 1,
            junk: vec![
                JunkRule {
                    rule: "placeholder".into(),
                    contains_any: phrases(&["test listing", "placeholder", "lorem ipsum", "do not buy"]),
                },
                JunkRule {
                    rule: "not_a_product".into(),
                    contains_any: phrases(&["gift card", "warranty extension", "repair service"]),
                },
            ],
            category_overrides: vec![CategoryRule {
                category: "accessories".into(),
                applies_to: phrases(&["headphones"]),
                contains_any: phrases(&[
                    "ear pads",
                    "earpads",
                    "replacement cable",
                    "headband cushion",
                    "carrying case",
                    "headphone stand",
                ]),
                unless_any: Vec::new(),
            }],
            brands: Vec::new(),
        }
    }
}

impl GuardRules {
    /// Reads `rules/guards.yaml` under `root`, or the built-in rules when absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("guards.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
struct CompiledJunk {
    rule: String,
    needles: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledCategory {
    category: String,
    applies_to: Vec<String>,
    needles: Vec<String>,
    unless: Vec<String>,
}

fn compile_needles(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|n| normalize(n))
        .filter(|n| !n.is_empty())
        .collect()
}

/// Junk and category guards over pre-normalized rule tables.
#[derive(Debug, Clone)]
pub struct RuleTableGuards {
    junk: Vec<CompiledJunk>,
    categories: Vec<CompiledCategory>,
}

impl RuleTableGuards {
    pub fn new(rules: &GuardRules) -> Self {
        Self {
            junk: rules
                .junk
                .iter()
                .map(|r| CompiledJunk {
                    rule: r.rule.clone(),
                    needles: compile_needles(&r.contains_any),
                })
                .collect(),
            categories: rules
                .category_overrides
                .iter()
                .map(|r| CompiledCategory {
                    category: r.category.clone(),
                    applies_to: r.applies_to.clone(),
                    needles: compile_needles(&r.contains_any),
                    unless: compile_needles(&r.unless_any),
                })
                .collect(),
        }
    }
}

impl JunkPredicate for RuleTableGuards {
    fn junk_rule(&self, title: &str) -> Option<&str> {
        let key = normalize(title);
        if key.is_empty() {
            return Some("empty_title");
        }
        self.junk
            .iter()
            .find(|r| r.needles.iter().any(|n| contains_phrase(&key, n)))
            .map(|r| r.rule.as_str())
    }
}

impl CategorySignal for RuleTableGuards {
    fn detect_category(&self, text: &str, assigned: &str) -> Option<&str> {
        let key = normalize(text);
        self.categories
            .iter()
            .filter(|r| r.category != assigned)
            .filter(|r| r.applies_to.is_empty() || r.applies_to.iter().any(|a| a == assigned))
            .find(|r| {
                r.needles.iter().any(|n| contains_phrase(&key, n))
                    && !r.unless.iter().any(|n| contains_phrase(&key, n))
            })
            .map(|r| r.category.as_str())
    }
}

/// Brand names and aliases, matched longest-first against titles.
#[derive(Debug, Clone, Default)]
pub struct BrandTable {
    // (normalized alias, display name), longest alias first
    entries: Vec<(String, String)>,
}

impl BrandTable {
    pub fn new(brands: &[BrandEntry]) -> Self {
        let mut entries: Vec<(String, String)> = brands
            .iter()
            .flat_map(|b| {
                std::iter::once(b.name.as_str())
                    .chain(b.aliases.iter().map(String::as_str))
                    .map(move |alias| (normalize(alias), b.name.clone()))
            })
            .filter(|(alias, _)| !alias.is_empty())
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        entries.dedup_by(|a, b| a.0 == b.0);
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, title: &str) -> Option<&str> {
        let key = normalize(title);
        self.entries
            .iter()
            .find(|(alias, _)| contains_phrase(&key, alias))
            .map(|(_, name)| name.as_str())
    }
}

/// A stored product whose name contradicts its recorded category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Misclassification {
    pub product_id: String,
    pub name: String,
    pub recorded_category: String,
    pub detected_category: String,
}

/// Offline sweep of already-merged products through a category signal.
pub fn audit_misclassified(
    products: &[CanonicalProduct],
    signal: &dyn CategorySignal,
) -> Vec<Misclassification> {
    products
        .iter()
        .filter_map(|p| {
            signal
                .detect_category(&p.name, &p.category)
                .map(|detected| Misclassification {
                    product_id: p.id.clone(),
                    name: p.name.clone(),
                    recorded_category: p.category.clone(),
                    detected_category: detected.to_string(),
                })
        })
        .collect()
}
