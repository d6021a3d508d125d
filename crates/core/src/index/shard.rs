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

//! In-memory shard fragment. One fragment is built per batch of
//! fetched pages and shipped to the coordinator for merging; the
//! on-disk shard engine is out of scope, but the fragment implements
//! the same posting-list contract so the query chain runs against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::index::{DocKey, SEGMENT_LEN};
use crate::phrases::parser::DocFrequency;
use crate::query::{Posting, PostingSource, SummaryStore};

/// Postings handed out per [`PostingSource::next_block`] call.
pub const BLOCK_SIZE: usize = 50;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct ShardFragment {
    postings: BTreeMap<String, Vec<Posting>>,
    summaries: Vec<u8>,
    /// Representative posting per inlink segment for real documents,
    /// used to resolve link pseudo-postings at query time.
    inlink_docs: BTreeMap<[u8; SEGMENT_LEN], Posting>,
    num_docs: u64,
}

impl ShardFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a document summary and returns its byte offset.
    pub fn add_summary(&mut self, title: &str, description: &str) -> u64 {
        let offset = self.summaries.len() as u64;
        let blob = format!("{title} {description}");

        self.summaries
            .extend_from_slice(&(blob.len() as u32).to_be_bytes());
        self.summaries.extend_from_slice(blob.as_bytes());

        offset
    }

    /// Adds every (term, positions) pair of one document to the
    /// fragment. Additive: postings for a term accumulate across
    /// documents in insertion order.
    #[allow(clippy::too_many_arguments)]
    pub fn add_document_words(
        &mut self,
        key: DocKey,
        doc_rank: Option<f64>,
        words: &BTreeMap<String, Vec<u32>>,
        meta_tags: &[String],
        summary_offset: u64,
        doc_len: usize,
        is_link: bool,
    ) {
        let doc_rank = doc_rank.unwrap_or(0.0);

        for (term, positions) in words {
            let relevance = if doc_len == 0 {
                0.0
            } else {
                positions.len() as f64 / doc_len as f64
            };

            self.postings.entry(term.clone()).or_default().push(Posting {
                doc: key,
                score: relevance + doc_rank,
                doc_rank,
                relevance,
                summary_offset,
                is_link,
            });
        }

        for tag in meta_tags {
            self.postings.entry(tag.clone()).or_default().push(Posting {
                doc: key,
                score: doc_rank,
                doc_rank,
                relevance: 0.0,
                summary_offset,
                is_link,
            });
        }

        if !is_link {
            self.inlink_docs
                .entry(key.inlink_segment())
                .or_insert(Posting {
                    doc: key,
                    score: doc_rank,
                    doc_rank,
                    relevance: 0.0,
                    summary_offset,
                    is_link: false,
                });
        }

        self.num_docs += 1;
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    /// Raw length-prefixed summary blob, shipped separately from the
    /// postings on upload.
    pub fn summary_bytes(&self) -> &[u8] {
        &self.summaries
    }

    pub fn num_terms(&self) -> usize {
        self.postings.len()
    }

    pub fn postings(&self, term: &str) -> &[Posting] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (fragment, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(fragment)
    }
}

impl DocFrequency for ShardFragment {
    fn doc_frequency(&self, term: &str) -> u64 {
        self.postings(term).len() as u64
    }
}

impl SummaryStore for ShardFragment {
    fn summary(&self, offset: u64) -> Option<String> {
        let offset = offset as usize;
        let len_bytes = self.summaries.get(offset..offset + 4)?;
        let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
        let blob = self.summaries.get(offset + 4..offset + 4 + len)?;

        String::from_utf8(blob.to_vec()).ok()
    }
}

/// Pull-based posting cursor over one term of a fragment.
pub struct FragmentPostings {
    fragment: Arc<ShardFragment>,
    term: String,
    pos: usize,
}

impl FragmentPostings {
    pub fn new(fragment: Arc<ShardFragment>, term: impl Into<String>) -> Self {
        Self {
            fragment,
            term: term.into(),
            pos: 0,
        }
    }

    pub fn fragment(&self) -> &Arc<ShardFragment> {
        &self.fragment
    }
}

impl PostingSource for FragmentPostings {
    fn next_block(&mut self) -> Option<Vec<Posting>> {
        let postings = self.fragment.postings(&self.term);

        if self.pos >= postings.len() {
            return None;
        }

        let end = (self.pos + BLOCK_SIZE).min(postings.len());
        let block = postings[self.pos..end].to_vec();
        self.pos = end;

        Some(block)
    }

    fn num_docs(&self) -> u64 {
        self.fragment.postings(&self.term).len() as u64
    }

    fn is_exhausted(&self) -> bool {
        self.pos >= self.fragment.postings(&self.term).len()
    }

    fn resolve_inlink(&mut self, segment: &[u8; SEGMENT_LEN]) -> Option<Posting> {
        self.fragment.inlink_docs.get(segment).cloned()
    }
}
