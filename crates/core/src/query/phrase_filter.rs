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

//! Restricts grouped results to documents whose summaries match every
//! required phrase and none of the disallowed ones.

use anyhow::Result;
use regex::{Regex, RegexBuilder};

use crate::index::SEGMENT_LEN;
use crate::query::{Posting, PostingSource, SummaryStore};

/// Builds the matcher for a restrict phrase. Literal segments are
/// quoted; `*` matches any run of characters. Matching is case
/// insensitive.
fn restrict_regex(phrase: &str) -> Result<Regex> {
    let pattern: String = phrase
        .split('*')
        .map(|segment| regex::escape(segment.trim()))
        .collect::<Vec<_>>()
        .join("(.)*");

    Ok(RegexBuilder::new(&pattern).case_insensitive(true).build()?)
}

pub struct PhraseFilterIterator<S: PostingSource, T: SummaryStore> {
    source: S,
    summaries: T,
    restrict: Vec<Regex>,
    disallow: Vec<String>,
    weight: f64,
    to_skip: usize,
    seen_docs: u64,
    seen_docs_unfiltered: u64,
}

impl<S: PostingSource, T: SummaryStore> PhraseFilterIterator<S, T> {
    pub fn new(
        source: S,
        summaries: T,
        restrict_phrases: &[String],
        disallow_phrases: &[String],
        weight: f64,
        limit: usize,
    ) -> Result<Self> {
        let restrict = restrict_phrases
            .iter()
            .map(|p| restrict_regex(p))
            .collect::<Result<Vec<_>>>()?;

        let disallow = disallow_phrases.iter().map(|p| p.to_lowercase()).collect();

        Ok(Self {
            source,
            summaries,
            restrict,
            disallow,
            weight,
            to_skip: limit,
            seen_docs: 0,
            seen_docs_unfiltered: 0,
        })
    }

    fn passes(&self, blob: &str) -> bool {
        if !self.restrict.iter().all(|re| re.is_match(blob)) {
            return false;
        }

        let lowercase = blob.to_lowercase();

        !self.disallow.iter().any(|p| lowercase.contains(p))
    }
}

impl<S: PostingSource, T: SummaryStore> PostingSource for PhraseFilterIterator<S, T> {
    fn next_block(&mut self) -> Option<Vec<Posting>> {
        loop {
            let block = self.source.next_block()?;

            self.seen_docs_unfiltered += block.len() as u64;

            let mut survivors: Vec<Posting> = block
                .into_iter()
                .filter(|posting| {
                    let blob = self
                        .summaries
                        .summary(posting.summary_offset)
                        .unwrap_or_default();

                    self.passes(&blob)
                })
                .map(|mut posting| {
                    posting.score *= self.weight;
                    posting
                })
                .collect();

            // skipped qualifiers still count towards the filter ratio
            self.seen_docs += survivors.len() as u64;

            // the initial limit skips the first qualifying documents
            if self.to_skip > 0 {
                let skipped = self.to_skip.min(survivors.len());
                survivors.drain(..skipped);
                self.to_skip -= skipped;
            }

            if !survivors.is_empty() {
                return Some(survivors);
            }
        }
    }

    fn num_docs(&self) -> u64 {
        if self.seen_docs_unfiltered == 0 {
            return self.source.num_docs();
        }

        self.seen_docs * self.source.num_docs() / self.seen_docs_unfiltered
    }

    fn is_exhausted(&self) -> bool {
        self.source.is_exhausted()
    }

    fn resolve_inlink(&mut self, segment: &[u8; SEGMENT_LEN]) -> Option<Posting> {
        self.source.resolve_inlink(segment)
    }
}
