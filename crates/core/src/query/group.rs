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

//! Groups postings that refer to the same page.
//!
//! Multiple postings share a URL hash when a page was seen through
//! several terms or through link-anchor pseudo-documents. Each group
//! collapses into one representative posting carrying aggregate
//! scores, and pages whose underlying data was not fully pulled get a
//! boost that extrapolates the score mass of inlinks not yet examined.

use hashbrown::{HashMap, HashSet};

use crate::index::SEGMENT_LEN;
use crate::query::{Posting, PostingSource};

/// Minimum number of postings pulled from the wrapped source before a
/// block of groups is emitted. Deliberately larger than the shard
/// cursor block size so one grouping pass sees several blocks.
pub const MIN_GROUP_BATCH: usize = 200;

#[derive(Debug)]
struct GroupFrame {
    representative: Posting,
    min_score: f64,
    max_score: f64,
    sum_score: f64,
    rank_sum: f64,
    relevance_sum: f64,
    count: u64,
}

impl GroupFrame {
    fn new(posting: Posting) -> Self {
        Self {
            min_score: posting.score,
            max_score: posting.score,
            sum_score: posting.score,
            rank_sum: posting.doc_rank,
            relevance_sum: posting.relevance,
            count: 1,
            representative: posting,
        }
    }

    fn fold(&mut self, posting: &Posting) {
        self.min_score = self.min_score.min(posting.score);
        self.max_score = self.max_score.max(posting.score);
        self.sum_score += posting.score;
        self.rank_sum += posting.doc_rank;
        self.relevance_sum += posting.relevance;
        self.count += 1;

        if !posting.is_link && self.representative.is_link {
            self.representative = posting.clone();
        }
    }
}

/// Extrapolated score mass of the inlinks between `observed` and
/// `estimated_total` under a Zipf-like rank-score decay fitted to the
/// observed min/max member scores.
///
/// This is a heuristic ranking signal. Every degenerate domain
/// (single inlink, equal min/max, estimate below observation) returns
/// zero rather than propagating a non-finite value.
pub fn unseen_score_boost(min: f64, max: f64, observed: f64, estimated_total: f64) -> f64 {
    if min <= 0.0 || max < min || observed < 1.0 {
        return 0.0;
    }

    if estimated_total <= observed || estimated_total <= 1.0 {
        return 0.0;
    }

    let alpha = ((max.ln() - min.ln()) / estimated_total.ln()).clamp(0.0, 1.0);

    if !alpha.is_finite() {
        return 0.0;
    }

    // integral of min * (x / observed)^(-alpha) from observed to total
    let boost = if (1.0 - alpha).abs() < 1e-9 {
        min * observed * (estimated_total / observed).ln()
    } else {
        min * observed.powf(alpha) * (estimated_total.powf(1.0 - alpha) - observed.powf(1.0 - alpha))
            / (1.0 - alpha)
    };

    if boost.is_finite() {
        boost.max(0.0)
    } else {
        0.0
    }
}

pub struct GroupIterator<S: PostingSource> {
    source: S,
    min_batch: usize,
    seen_urls: HashSet<[u8; SEGMENT_LEN]>,
    discarded_content: HashSet<[u8; SEGMENT_LEN]>,
    seen_docs: u64,
    seen_docs_unfiltered: u64,
}

impl<S: PostingSource> GroupIterator<S> {
    pub fn new(source: S) -> Self {
        Self::with_min_batch(source, MIN_GROUP_BATCH)
    }

    pub fn with_min_batch(source: S, min_batch: usize) -> Self {
        Self {
            source,
            min_batch,
            seen_urls: HashSet::new(),
            discarded_content: HashSet::new(),
            seen_docs: 0,
            seen_docs_unfiltered: 0,
        }
    }

    fn fill(&mut self) -> Vec<Posting> {
        let mut postings = Vec::new();

        while postings.len() < self.min_batch {
            match self.source.next_block() {
                Some(block) => postings.extend(block),
                None => break,
            }
        }

        postings
    }

    fn group(&mut self, postings: Vec<Posting>) -> Vec<GroupFrame> {
        let mut frames: Vec<GroupFrame> = Vec::new();
        let mut by_url: HashMap<[u8; SEGMENT_LEN], usize> = HashMap::new();

        for posting in postings {
            let url = posting.doc.url_segment();

            if self.seen_urls.contains(&url) {
                continue;
            }

            if self
                .discarded_content
                .contains(&posting.doc.content_segment())
            {
                continue;
            }

            match by_url.get(&url) {
                Some(&idx) => frames[idx].fold(&posting),
                None => {
                    by_url.insert(url, frames.len());
                    frames.push(GroupFrame::new(posting));
                }
            }
        }

        // link pseudo-postings without a direct document: try to
        // resolve the linked document and fold its relevance in
        for frame in &mut frames {
            if frame.representative.is_link {
                if let Some(resolved) = self
                    .source
                    .resolve_inlink(&frame.representative.doc.inlink_segment())
                {
                    frame.relevance_sum += resolved.relevance;
                    frame.rank_sum += resolved.doc_rank;
                    frame.representative = resolved;
                }
            }
        }

        self.arbitrate_duplicates(frames)
    }

    /// Two URL-hash groups sharing a content hash are the same page
    /// under different URLs. Only the higher scoring group survives;
    /// the losing content hash is never emitted again.
    fn arbitrate_duplicates(&mut self, frames: Vec<GroupFrame>) -> Vec<GroupFrame> {
        let mut result: Vec<GroupFrame> = Vec::new();
        let mut by_content: HashMap<[u8; SEGMENT_LEN], usize> = HashMap::new();

        for frame in frames {
            let content = frame.representative.doc.content_segment();

            match by_content.get(&content) {
                Some(&idx) => {
                    if frame.sum_score > result[idx].sum_score {
                        let loser = std::mem::replace(&mut result[idx], frame);
                        self.discard(loser);
                    } else {
                        self.discard(frame);
                    }
                }
                None => {
                    by_content.insert(content, result.len());
                    result.push(frame);
                }
            }
        }

        result
    }

    fn discard(&mut self, frame: GroupFrame) {
        self.discarded_content
            .insert(frame.representative.doc.content_segment());
        self.seen_urls
            .insert(frame.representative.doc.url_segment());
    }

    fn score(&self, frame: &GroupFrame, pulled: usize, apply_boost: bool) -> f64 {
        let aggregate = frame.sum_score;

        let boost = if apply_boost && pulled > 0 {
            // empirical probability of this page among the pulled
            // postings, extrapolated to the full posting list
            let estimated_total =
                frame.count as f64 / pulled as f64 * self.source.num_docs() as f64;

            unseen_score_boost(
                frame.min_score,
                frame.max_score,
                frame.count as f64,
                estimated_total,
            )
        } else {
            0.0
        };

        (aggregate + boost) * (1.0 + frame.relevance_sum) / 2.0
    }

    /// Extrapolated total number of groups, used for pagination
    /// progress. Ratio of emitted groups to pulled postings scaled to
    /// the source estimate.
    fn estimate_num_docs(&self) -> u64 {
        if self.seen_docs_unfiltered == 0 {
            return self.source.num_docs();
        }

        self.seen_docs * self.source.num_docs() / self.seen_docs_unfiltered
    }
}

impl<S: PostingSource> PostingSource for GroupIterator<S> {
    fn next_block(&mut self) -> Option<Vec<Posting>> {
        loop {
            let postings = self.fill();

            if postings.is_empty() {
                return None;
            }

            let pulled = postings.len();
            let apply_boost = !self.source.is_exhausted();

            let frames = self.group(postings);

            let mut block = Vec::with_capacity(frames.len());

            for frame in frames {
                let score = self.score(&frame, pulled, apply_boost);

                self.seen_urls
                    .insert(frame.representative.doc.url_segment());

                let mut posting = frame.representative.clone();
                posting.score = score;
                posting.doc_rank = frame.rank_sum;
                posting.relevance = frame.relevance_sum;
                block.push(posting);
            }

            self.seen_docs += block.len() as u64;
            self.seen_docs_unfiltered += pulled as u64;

            // a batch can consist entirely of already seen or
            // discarded pages; keep pulling rather than emitting an
            // empty block
            if !block.is_empty() {
                return Some(block);
            }
        }
    }

    fn num_docs(&self) -> u64 {
        self.estimate_num_docs()
    }

    fn is_exhausted(&self) -> bool {
        self.source.is_exhausted()
    }

    fn resolve_inlink(&mut self, segment: &[u8; SEGMENT_LEN]) -> Option<Posting> {
        self.source.resolve_inlink(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DocKey;
    use std::collections::VecDeque;

    struct MockSource {
        blocks: VecDeque<Vec<Posting>>,
        num_docs: u64,
        resolutions: Vec<Posting>,
    }

    impl MockSource {
        fn new(blocks: Vec<Vec<Posting>>) -> Self {
            let num_docs = blocks.iter().map(|b| b.len() as u64).sum();
            Self {
                blocks: blocks.into(),
                num_docs,
                resolutions: Vec::new(),
            }
        }

        fn with_num_docs(mut self, num_docs: u64) -> Self {
            self.num_docs = num_docs;
            self
        }

        fn with_resolution(mut self, posting: Posting) -> Self {
            self.resolutions.push(posting);
            self
        }
    }

    impl PostingSource for MockSource {
        fn next_block(&mut self) -> Option<Vec<Posting>> {
            self.blocks.pop_front()
        }

        fn num_docs(&self) -> u64 {
            self.num_docs
        }

        fn is_exhausted(&self) -> bool {
            self.blocks.is_empty()
        }

        fn resolve_inlink(&mut self, segment: &[u8; SEGMENT_LEN]) -> Option<Posting> {
            self.resolutions
                .iter()
                .find(|p| p.doc.inlink_segment() == *segment)
                .cloned()
        }
    }

    fn posting(url: &str, content: &str, score: f64) -> Posting {
        Posting {
            doc: DocKey::new(url, content, "example.com"),
            score,
            doc_rank: 1.0,
            relevance: 0.5,
            summary_offset: 0,
            is_link: false,
        }
    }

    #[test]
    fn postings_of_one_page_group_together() {
        let source = MockSource::new(vec![vec![
            posting("https://a.com/", "a", 1.0),
            posting("https://a.com/", "a", 3.0),
            posting("https://b.com/", "b", 2.0),
        ]]);

        let mut iter = GroupIterator::with_min_batch(source, 10);
        let block = iter.next_block().unwrap();

        assert_eq!(block.len(), 2);
        // grouped page carries aggregate relevance of both members
        assert!((block[0].relevance - 1.0).abs() < 1e-9);
        assert!((block[1].relevance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn seen_urls_never_reemitted() {
        let source = MockSource::new(vec![
            vec![posting("https://a.com/", "a", 1.0)],
            vec![
                posting("https://a.com/", "a", 5.0),
                posting("https://b.com/", "b", 2.0),
            ],
        ]);

        // min_batch of 1 so each call pulls one block
        let mut iter = GroupIterator::with_min_batch(source, 1);

        let first = iter.next_block().unwrap();
        assert_eq!(first.len(), 1);

        let second = iter.next_block().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].doc.url_segment(),
            posting("https://b.com/", "b", 2.0).doc.url_segment()
        );
    }

    #[test]
    fn duplicate_content_keeps_higher_scoring_group() {
        let source = MockSource::new(vec![
            vec![
                posting("https://a.com/x", "same", 5.0),
                posting("https://mirror.com/x", "same", 1.0),
            ],
            vec![posting("https://mirror2.com/x", "same", 9.0)],
        ]);

        let mut iter = GroupIterator::with_min_batch(source, 2);

        let first = iter.next_block().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(
            first[0].doc.url_segment(),
            posting("https://a.com/x", "same", 5.0).doc.url_segment()
        );

        // discarded content hash is never emitted again, even from a
        // new url
        assert!(iter.next_block().is_none());
    }

    #[test]
    fn exhausted_source_gets_no_boost() {
        let source = MockSource::new(vec![vec![posting("https://a.com/", "a", 2.0)]]);
        let mut iter = GroupIterator::with_min_batch(source, 10);

        let block = iter.next_block().unwrap();

        // aggregate 2.0, relevance 0.5 => 2.0 * 1.5 / 2.0
        assert!((block[0].score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn unexhausted_source_scores_at_least_aggregate() {
        let mut members = vec![
            posting("https://a.com/", "a", 1.0),
            posting("https://a.com/", "a", 4.0),
        ];
        members[1].relevance = 0.0;
        members[0].relevance = 0.0;

        let source =
            MockSource::new(vec![members, vec![posting("https://b.com/", "b", 1.0)]])
                .with_num_docs(10_000);

        let mut iter = GroupIterator::with_min_batch(source, 1);
        let block = iter.next_block().unwrap();

        // boost is non-negative
        assert!(block[0].score >= 5.0 / 2.0);
    }

    #[test]
    fn boost_monotone_in_estimated_total() {
        let mut last = 0.0;

        for total in [10.0, 100.0, 1_000.0, 10_000.0] {
            let boost = unseen_score_boost(1.0, 8.0, 4.0, total);
            assert!(boost >= last);
            last = boost;
        }
    }

    #[test]
    fn boost_domain_guards() {
        assert_eq!(unseen_score_boost(0.0, 5.0, 4.0, 100.0), 0.0);
        assert_eq!(unseen_score_boost(5.0, 1.0, 4.0, 100.0), 0.0);
        assert_eq!(unseen_score_boost(1.0, 5.0, 0.0, 100.0), 0.0);
        assert_eq!(unseen_score_boost(1.0, 5.0, 40.0, 30.0), 0.0);
        assert_eq!(unseen_score_boost(1.0, 5.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn equal_min_max_still_boosts_monotonically() {
        let small = unseen_score_boost(2.0, 2.0, 2.0, 10.0);
        let large = unseen_score_boost(2.0, 2.0, 2.0, 100.0);

        assert!(small >= 0.0);
        assert!(large >= small);
    }

    #[test]
    fn link_posting_resolves_to_real_document() {
        let mut link = posting("link:1:https://a.com/", "anchor", 1.0);
        link.is_link = true;

        let mut real = posting("https://a.com/", "content", 2.0);
        real.relevance = 0.7;

        let source = MockSource::new(vec![vec![link]]).with_resolution(real.clone());

        let mut iter = GroupIterator::with_min_batch(source, 10);
        let block = iter.next_block().unwrap();

        assert_eq!(block.len(), 1);
        assert!(!block[0].is_link);
        assert_eq!(block[0].doc, real.doc);
    }

    #[test]
    fn num_docs_extrapolates_from_group_ratio() {
        let source = MockSource::new(vec![
            vec![
                posting("https://a.com/", "a", 1.0),
                posting("https://a.com/", "a", 2.0),
            ],
            vec![posting("https://b.com/", "b", 1.0)],
        ])
        .with_num_docs(300);

        let mut iter = GroupIterator::with_min_batch(source, 2);
        iter.next_block().unwrap();

        // one group from two postings => half the source estimate
        assert_eq!(iter.num_docs(), 150);
    }
}
