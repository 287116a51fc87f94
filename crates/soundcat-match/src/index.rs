//! Precomputed candidate representations, partitioned by category and brand.

use std::collections::{BTreeMap, BTreeSet};

use soundcat_core::{IndexScope, MatchCandidate};

use crate::normalize::{compact_key, model_tokens, normalize, token_set};

/// A candidate with its normalized forms computed once at insert time.
#[derive(Debug, Clone)]
pub struct IndexedCandidate {
    pub candidate: MatchCandidate,
    pub normalized: String,
    pub(crate) tokens: BTreeSet<String>,
    pub(crate) compact: String,
    pub(crate) models: BTreeSet<String>,
    pub(crate) brand_key: Option<String>,
}

impl IndexedCandidate {
    pub fn new(candidate: MatchCandidate) -> Self {
        let normalized = normalize(&candidate.name);
        let tokens = token_set(&normalized);
        let models = model_tokens(&tokens);
        let compact = compact_key(&normalized);
        let brand_key = candidate
            .brand
            .as_deref()
            .map(normalize)
            .filter(|b| !b.is_empty());
        Self {
            candidate,
            normalized,
            tokens,
            compact,
            models,
            brand_key,
        }
    }
}

/// Append-only ordered collection of indexed candidates.
#[derive(Debug, Clone, Default)]
pub struct CandidateIndex {
    entries: Vec<IndexedCandidate>,
}

impl CandidateIndex {
    pub fn build(candidates: impl IntoIterator<Item = MatchCandidate>) -> Self {
        let mut index = Self::default();
        for candidate in candidates {
            index.extend(candidate);
        }
        index
    }

    pub fn extend(&mut self, candidate: MatchCandidate) {
        self.push(IndexedCandidate::new(candidate));
    }

    fn push(&mut self, entry: IndexedCandidate) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedCandidate> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Default)]
struct CategoryPartition {
    all: CandidateIndex,
    by_brand: BTreeMap<String, CandidateIndex>,
}

/// Whole-catalog index: one category-wide index per category, plus
/// brand-narrowed sub-indexes within each category.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    categories: BTreeMap<String, CategoryPartition>,
    ids: BTreeSet<String>,
}

impl CatalogIndex {
    pub fn build(candidates: impl IntoIterator<Item = MatchCandidate>) -> Self {
        let mut index = Self::default();
        for candidate in candidates {
            index.extend(candidate);
        }
        index
    }

    /// Adds a candidate so later queries observe it. Duplicate ids are ignored.
    pub fn extend(&mut self, candidate: MatchCandidate) -> bool {
        if !self.ids.insert(candidate.id.clone()) {
            return false;
        }
        let entry = IndexedCandidate::new(candidate);
        let partition = self
            .categories
            .entry(entry.candidate.category.clone())
            .or_default();
        if let Some(brand) = &entry.brand_key {
            partition
                .by_brand
                .entry(brand.clone())
                .or_default()
                .push(entry.clone());
        }
        partition.all.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn category(&self, category: &str) -> Option<&CandidateIndex> {
        self.categories.get(category).map(|p| &p.all)
    }

    /// Brand-narrowed index when the brand is known and has entries in the
    /// category, otherwise the category-wide index.
    pub fn scoped(&self, category: &str, brand: Option<&str>) -> Option<(IndexScope, &CandidateIndex)> {
        let partition = self.categories.get(category)?;
        if let Some(brand) = brand.map(normalize) {
            if let Some(sub) = partition.by_brand.get(&brand).filter(|s| !s.is_empty()) {
                return Some((IndexScope::Brand, sub));
            }
        }
        if partition.all.is_empty() {
            return None;
        }
        Some((IndexScope::Category, &partition.all))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, name: &str, brand: Option<&str>, category: &str) -> MatchCandidate {
        MatchCandidate {
            id: id.into(),
            name: name.into(),
            brand: brand.map(Into::into),
            category: category.into(),
        }
    }

    fn catalog() -> CatalogIndex {
        CatalogIndex::build([
            candidate("c1", "Sennheiser HD 600", Some("Sennheiser"), "headphones"),
            candidate("c2", "Beyerdynamic DT 990 Pro", Some("Beyerdynamic"), "headphones"),
            candidate("c3", "Grado SR80x", None, "headphones"),
            candidate("c4", "Focusrite Scarlett 2i2", Some("Focusrite"), "audio-interfaces"),
        ])
    }

    #[test]
    fn candidates_are_normalized_once_on_insert() {
        let index = CandidateIndex::build([candidate("c1", "Sennheiser HD600", None, "h")]);
        let entry = index.iter().next().unwrap();
        assert_eq!(entry.normalized, "sennheiser hd 600");
        assert_eq!(entry.compact, "sennheiserhd600");
        assert!(entry.models.contains("600"));
    }

    #[test]
    fn prefers_brand_narrowed_index_when_populated() {
        let index = catalog();
        let (scope, sub) = index.scoped("headphones", Some("SENNHEISER")).unwrap();
        assert_eq!(scope, IndexScope::Brand);
        assert_eq!(sub.len(), 1);

        let (scope, all) = index.scoped("headphones", Some("Grado")).unwrap();
        assert_eq!(scope, IndexScope::Category);
        assert_eq!(all.len(), 3);

        let (scope, _) = index.scoped("headphones", None).unwrap();
        assert_eq!(scope, IndexScope::Category);
        assert!(index.scoped("turntables", None).is_none());
    }

    #[test]
    fn extension_is_visible_to_later_queries() {
        let mut index = catalog();
        assert!(index.scoped("turntables", None).is_none());
        assert!(index.extend(candidate("c9", "Rega Planar 1", Some("Rega"), "turntables")));
        assert!(!index.extend(candidate("c9", "Rega Planar 1", Some("Rega"), "turntables")));
        let (scope, sub) = index.scoped("turntables", Some("rega")).unwrap();
        assert_eq!(scope, IndexScope::Brand);
        assert_eq!(sub.len(), 1);
        assert_eq!(index.len(), 5);
        assert!(index.contains("c9"));
    }
}
