//! Scored fuzzy matching of a listing title against a candidate index.

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

use crate::index::{CandidateIndex, IndexedCandidate};
use crate::normalize::{compact_key, contains_phrase, model_tokens, normalize, token_set};

const TOKEN_WEIGHT: f64 = 0.7;
const EDIT_WEIGHT: f64 = 0.3;
const MODEL_MISMATCH_FACTOR: f64 = 0.6;
const BRAND_BOOST: f64 = 0.05;
const BRAND_ABSENT_FACTOR: f64 = 0.85;

#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub id: String,
    pub name: String,
    pub category: String,
    pub score: f64,
    /// The candidate carries the query brand (by record or by name).
    pub brand_containment: bool,
}

/// A title normalized once for scoring against many candidates.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    tokens: BTreeSet<String>,
    compact: String,
    models: BTreeSet<String>,
    brand: Option<String>,
}

impl PreparedQuery {
    pub fn new(title: &str, brand: Option<&str>) -> Self {
        let normalized = normalize(title);
        let tokens = token_set(&normalized);
        Self {
            models: model_tokens(&tokens),
            compact: compact_key(&normalized),
            tokens,
            brand: brand.map(normalize).filter(|b| !b.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BrandSignal {
    Agrees,
    Unknown,
    Absent,
    Conflicts,
}

fn brand_signal(query: &PreparedQuery, entry: &IndexedCandidate) -> BrandSignal {
    let Some(brand) = &query.brand else {
        return BrandSignal::Unknown;
    };
    match &entry.brand_key {
        Some(recorded) if recorded == brand => BrandSignal::Agrees,
        Some(_) => BrandSignal::Conflicts,
        None if contains_phrase(&entry.normalized, brand) => BrandSignal::Agrees,
        None => BrandSignal::Absent,
    }
}

/// Text similarity in `[0, 1]` before any brand adjustment.
pub fn text_similarity(query: &PreparedQuery, entry: &IndexedCandidate) -> f64 {
    if query.tokens.is_empty() || entry.tokens.is_empty() {
        return 0.0;
    }
    let shared = query.tokens.intersection(&entry.tokens).count() as f64;
    let dice = 2.0 * shared / (query.tokens.len() + entry.tokens.len()) as f64;
    let containment = shared / entry.tokens.len() as f64;
    let token_score = (dice + containment) / 2.0;
    let edit_score = normalized_levenshtein(&query.compact, &entry.compact);
    let text = TOKEN_WEIGHT * token_score + EDIT_WEIGHT * edit_score;
    if models_compatible(&query.models, &entry.models) {
        text
    } else {
        text * MODEL_MISMATCH_FACTOR
    }
}

fn models_compatible(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.is_empty() || b.is_empty() || a.is_subset(b) || b.is_subset(a)
}

/// Final score with the brand adjustment applied; `None` when disqualified.
fn score_entry(query: &PreparedQuery, entry: &IndexedCandidate) -> Option<(f64, bool)> {
    let raw = text_similarity(query, entry);
    match brand_signal(query, entry) {
        BrandSignal::Conflicts => None,
        BrandSignal::Agrees => Some(((raw + BRAND_BOOST).min(1.0), true)),
        BrandSignal::Unknown => Some((raw, true)),
        BrandSignal::Absent => Some((raw * BRAND_ABSENT_FACTOR, false)),
    }
}

/// Highest-scoring candidate; ties resolve to the lowest candidate id.
pub fn find_best_match(title: &str, index: &CandidateIndex, brand: Option<&str>) -> Option<BestMatch> {
    let query = PreparedQuery::new(title, brand);
    find_best_prepared(&query, index)
}

pub fn find_best_prepared(query: &PreparedQuery, index: &CandidateIndex) -> Option<BestMatch> {
    let mut best: Option<(f64, bool, &IndexedCandidate)> = None;
    for entry in index.iter() {
        let Some((score, containment)) = score_entry(query, entry) else {
            continue;
        };
        if score <= 0.0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_score, _, best_entry)) => {
                score > *best_score
                    || (score == *best_score && entry.candidate.id < best_entry.candidate.id)
            }
        };
        if better {
            best = Some((score, containment, entry));
        }
    }
    best.map(|(score, brand_containment, entry)| BestMatch {
        id: entry.candidate.id.clone(),
        name: entry.candidate.name.clone(),
        category: entry.candidate.category.clone(),
        score,
        brand_containment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundcat_core::MatchCandidate;

    fn candidate(id: &str, name: &str, brand: Option<&str>) -> MatchCandidate {
        MatchCandidate {
            id: id.into(),
            name: name.into(),
            brand: brand.map(Into::into),
            category: "headphones".into(),
        }
    }

    fn index() -> CandidateIndex {
        CandidateIndex::build([
            candidate("c1", "Sennheiser HD 600", Some("Sennheiser")),
            candidate("c2", "Sennheiser HD 650", Some("Sennheiser")),
            candidate("c3", "Beyerdynamic DT 990 Pro", Some("Beyerdynamic")),
            candidate("c4", "Grado SR80x", None),
        ])
    }

    #[test]
    fn exact_member_scores_the_maximum() {
        let index = index();
        for entry in index.iter() {
            let best = find_best_match(&entry.candidate.name, &index, None).unwrap();
            assert_eq!(best.id, entry.candidate.id);
            assert!((best.score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn exact_name_and_brand_clear_the_auto_bar() {
        let best = find_best_match("Sennheiser HD600", &index(), Some("Sennheiser")).unwrap();
        assert_eq!(best.id, "c1");
        assert!(best.score >= 0.85);
        assert!(best.brand_containment);
    }

    #[test]
    fn model_numbers_must_agree() {
        let index = index();
        let best = find_best_match("Sennheiser HD 650", &index, None).unwrap();
        assert_eq!(best.id, "c2");
        let hd600 = index.iter().find(|e| e.candidate.id == "c1").unwrap();
        let q = PreparedQuery::new("Sennheiser HD 650", None);
        assert!(text_similarity(&q, hd600) < 0.6);
    }

    #[test]
    fn conflicting_recorded_brand_disqualifies() {
        let best = find_best_match("DT 990 Pro", &index(), Some("Sennheiser"));
        assert!(best.map(|b| b.id != "c3").unwrap_or(true));
    }

    #[test]
    fn brand_in_name_counts_as_containment() {
        let best = find_best_match("Grado SR80x", &index(), Some("grado")).unwrap();
        assert_eq!(best.id, "c4");
        assert!(best.brand_containment);
        assert!((best.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_brand_signal_is_penalized_not_dropped() {
        let index = CandidateIndex::build([candidate("z1", "SR80x Prestige", None)]);
        let best = find_best_match("SR80x Prestige", &index, Some("Grado")).unwrap();
        assert!(!best.brand_containment);
        assert!((best.score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn ties_break_to_the_lowest_id() {
        let index = CandidateIndex::build([
            candidate("b", "Koss Porta Pro", None),
            candidate("a", "Koss Porta Pro", None),
        ]);
        assert_eq!(find_best_match("Koss Porta Pro", &index, None).unwrap().id, "a");
    }

    #[test]
    fn higher_similarity_never_scores_lower() {
        let index = index();
        let q = PreparedQuery::new("Beyerdynamic DT 990 Pro 250 Ohm", Some("Beyerdynamic"));
        let near = find_best_prepared(&q, &index).unwrap();
        let q_far = PreparedQuery::new("Beyerdynamic DT 990 Pro 250 Ohm black edition studio", Some("Beyerdynamic"));
        let far = find_best_prepared(&q_far, &index).unwrap();
        assert_eq!(near.id, "c3");
        assert_eq!(far.id, "c3");
        assert!(near.score > far.score);
    }

    #[test]
    fn empty_titles_match_nothing() {
        assert!(find_best_match("!!!", &index(), None).is_none());
    }
}
