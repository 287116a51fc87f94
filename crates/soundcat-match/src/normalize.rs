//! Text canonicalization shared by index keys and listing content keys.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

/// Marketing filler that never distinguishes one product from another.
const NOISE_TOKENS: &[&str] = &[
    "new", "brand", "official", "genuine", "original", "authentic", "sale", "free", "shipping",
    "hot", "best", "seller", "bestseller", "limited", "offer", "deal", "discount", "the", "with",
    "for", "and",
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Alpha,
    Digit,
}

fn class_of(c: char) -> CharClass {
    if c.is_ascii_digit() {
        CharClass::Digit
    } else {
        CharClass::Alpha
    }
}

/// Lowercases, strips punctuation and marketing noise, and splits letter/digit
/// runs so "HD600" and "HD 600" share a key. Idempotent.
pub fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut spaced = String::with_capacity(lowered.len() + 8);
    let mut prev: Option<CharClass> = None;
    for c in lowered.chars() {
        if !c.is_alphanumeric() {
            spaced.push(' ');
            prev = None;
            continue;
        }
        let class = class_of(c);
        if prev.is_some_and(|p| p != class) {
            spaced.push(' ');
        }
        spaced.push(c);
        prev = Some(class);
    }
    spaced
        .split_whitespace()
        .filter(|token| !NOISE_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized form with separators removed, for edit-distance comparison.
pub fn compact_key(normalized: &str) -> String {
    normalized.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn token_set(normalized: &str) -> BTreeSet<String> {
    normalized.split_whitespace().map(str::to_string).collect()
}

/// Numeric tokens; these carry model numbers ("600" in "hd 600").
pub fn model_tokens(tokens: &BTreeSet<String>) -> BTreeSet<String> {
    tokens
        .iter()
        .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
        .cloned()
        .collect()
}

/// True when `needle` occurs in `haystack` on token boundaries. Both normalized.
pub fn contains_phrase(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    format!(" {haystack} ").contains(&format!(" {needle} "))
}

/// Stable dedup key for a listing title as seen at one retailer.
pub fn content_key(retailer_id: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(retailer_id.as_bytes());
    hasher.update(b":");
    hasher.update(normalize(title).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_case_punctuation_and_noise() {
        assert_eq!(
            normalize("NEW!! Sennheiser HD-600 (Official) w/ Free Shipping"),
            "sennheiser hd 600 w"
        );
        assert_eq!(normalize("Sennheiser HD600"), normalize("sennheiser hd 600"));
    }

    #[test]
    fn keeps_model_distinguishing_tokens() {
        assert_ne!(normalize("HD 600"), normalize("HD 650"));
        assert_eq!(normalize("Scarlett 2i2 3rd Gen"), "scarlett 2 i 2 3 rd gen");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "Sennheiser HD600",
            "  Beyerdynamic DT-990 PRO / 250Ω  ",
            "Focusrite Scarlett 2i2 (3rd Gen) USB",
            "İstanbul Ünïcode ½ test",
            "the and for with",
            "",
            "!!!",
            "a1b2c3",
        ];
        for raw in samples {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn model_tokens_are_the_numeric_ones() {
        let tokens = token_set(&normalize("DT 990 Pro 250 Ohm"));
        let models: Vec<_> = model_tokens(&tokens).into_iter().collect();
        assert_eq!(models, vec!["250".to_string(), "990".to_string()]);
    }

    #[test]
    fn phrases_match_on_token_boundaries() {
        assert!(contains_phrase("replacement ear pads hd 600", "ear pads"));
        assert!(!contains_phrase("earpads hd 600", "ear pads"));
        assert!(!contains_phrase("anything", ""));
    }

    #[test]
    fn content_keys_ignore_presentation_noise() {
        assert_eq!(
            content_key("shop", "Sennheiser HD600"),
            content_key("shop", "SENNHEISER hd-600!")
        );
        assert_ne!(
            content_key("shop", "Sennheiser HD600"),
            content_key("other", "Sennheiser HD600")
        );
        assert_eq!(content_key("shop", "x").len(), 64);
    }
}
