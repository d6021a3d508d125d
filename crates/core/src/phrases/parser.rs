// Trawler is an open source distributed web crawler and search indexer.
// Copyright (C) 2024 Trawler
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Maximal phrase extraction.
//!
//! A phrase grows rightward from an anchor term while every occurrence
//! of the current term agrees on the token that follows it. The first
//! disagreement (or the end of the document) ends the phrase. Indexing
//! only these maximal runs keeps the index from storing every
//! sub-phrase of every sentence.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;

use crate::phrases;

/// Document frequency above which a multi-term phrase is common enough
/// to be kept as a single index term.
pub const PHRASE_GROUP_THRESHOLD: u64 = 10;

/// Upper bound on the number of terms in a query.
pub const MAX_QUERY_TERMS: usize = 10;

const UNSAFE_TERMS: [&str; 12] = [
    "porn", "porno", "xxx", "sex", "viagra", "casino", "nude", "naked", "escort", "erotik",
    "erotic", "fetish",
];

/// Looks up how many documents a term occurs in. Implemented by the
/// shard store; tests use a fixed map.
pub trait DocFrequency {
    fn doc_frequency(&self, term: &str) -> u64;
}

impl DocFrequency for BTreeMap<String, u64> {
    fn doc_frequency(&self, term: &str) -> u64 {
        self.get(term).copied().unwrap_or(0)
    }
}

/// The two-term wildcard form of a phrase: its endpoint terms in
/// lexicographic order with a gap marker between them.
pub fn wildcard_form(first: &str, last: &str) -> String {
    let (a, b) = if first <= last {
        (first, last)
    } else {
        (last, first)
    };

    format!("{a} * {b}")
}

/// Extracts every stem and every maximal phrase of `text` together
/// with the sorted, de-duplicated token positions it occurs at.
/// Maximal phrases also emit their wildcard form at the same
/// positions.
pub fn extract_phrases(text: &str, locale: &str) -> BTreeMap<String, Vec<u32>> {
    let tokens = phrases::tokenize(text, locale);
    phrases_of_tokens(&tokens)
}

fn phrases_of_tokens(tokens: &[String]) -> BTreeMap<String, Vec<u32>> {
    let occurrences: HashMap<&str, Vec<usize>> = tokens
        .iter()
        .enumerate()
        .map(|(pos, token)| (token.as_str(), pos))
        .into_group_map();

    let mut result: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();

    for (pos, token) in tokens.iter().enumerate() {
        result
            .entry(token.clone())
            .or_default()
            .insert(pos as u32);
    }

    for start in 0..tokens.len() {
        let mut end = start;

        while let Some(next) = tokens.get(end + 1) {
            let agrees = occurrences[tokens[end].as_str()]
                .iter()
                .all(|&p| tokens.get(p + 1) == Some(next));

            if !agrees {
                break;
            }

            end += 1;
        }

        if end > start {
            let phrase = tokens[start..=end].join(" ");
            let wildcard = wildcard_form(&tokens[start], &tokens[end]);

            result
                .entry(phrase)
                .or_default()
                .insert(start as u32);
            result
                .entry(wildcard)
                .or_default()
                .insert(start as u32);
        }
    }

    result
        .into_iter()
        .map(|(k, v)| (k, v.into_iter().collect()))
        .collect()
}

fn is_wildcard(term: &str) -> bool {
    term.contains(" * ")
}

fn num_terms(phrase: &str) -> usize {
    phrase.split(' ').count()
}

/// Index-aware variant of [`extract_phrases`].
///
/// Long or rare phrases are demoted to pairwise wildcard phrases, and
/// a wildcard phrase whose components are all rare collapses further
/// into its single stems. Common phrases survive whole so exact
/// multi-word queries against them stay cheap.
pub fn index_aware_phrases<D: DocFrequency>(
    text: &str,
    locale: &str,
    df: &D,
) -> BTreeMap<String, Vec<u32>> {
    let all = extract_phrases(text, locale);
    let mut result: BTreeMap<String, Vec<u32>> = BTreeMap::new();

    for (term, positions) in all {
        if is_wildcard(&term) || num_terms(&term) == 1 {
            if !is_wildcard(&term) {
                result.insert(term, positions);
            }
            continue;
        }

        let terms: Vec<&str> = term.split(' ').collect();

        if df.doc_frequency(&term) > PHRASE_GROUP_THRESHOLD || terms.len() > MAX_QUERY_TERMS / 2 {
            result.insert(term, positions);
            continue;
        }

        for (offset, pair) in terms.windows(2).enumerate() {
            let wildcard = wildcard_form(pair[0], pair[1]);

            let all_rare = df.doc_frequency(&wildcard) < 3 * PHRASE_GROUP_THRESHOLD
                && df.doc_frequency(pair[0]) < 3 * PHRASE_GROUP_THRESHOLD
                && df.doc_frequency(pair[1]) < 3 * PHRASE_GROUP_THRESHOLD;

            // the single stems are already in the result, so a rare
            // pair contributes nothing extra
            if all_rare {
                continue;
            }

            let entry = result.entry(wildcard).or_default();
            for pos in &positions {
                let pos = pos + offset as u32;
                if !entry.contains(&pos) {
                    entry.push(pos);
                }
            }
            entry.sort_unstable();
        }
    }

    result
}

/// Scores how likely a document is unsafe from the overlap between its
/// term position lists and a fixed unsafe-term lexicon, normalized by
/// document length. Higher means more likely unsafe.
pub fn unsafe_score(terms: &BTreeMap<String, Vec<u32>>, doc_len: usize) -> f64 {
    if doc_len == 0 {
        return 0.0;
    }

    let hits: usize = UNSAFE_TERMS
        .iter()
        .filter_map(|term| terms.get(*term))
        .map(|positions| positions.len())
        .sum();

    hits as f64 / doc_len as f64
}
