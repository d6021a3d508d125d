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

//! Query-time iterator chain. Iterators are pull-based and
//! single-threaded: every call pulls exactly one block from the
//! wrapped source and performs no I/O of its own.

pub mod group;
pub mod phrase_filter;

use crate::index::{DocKey, SEGMENT_LEN};

/// One posting as produced by the shard store: a document key with the
/// scores attached to this term occurrence and the offset of the
/// document summary.
#[derive(
    Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Posting {
    pub doc: DocKey,
    pub score: f64,
    pub doc_rank: f64,
    pub relevance: f64,
    pub summary_offset: u64,
    /// True for link-anchor pseudo-documents.
    pub is_link: bool,
}

/// Contract the shard store exposes to the iterator chain.
pub trait PostingSource {
    /// Pulls the next block of postings. Returns `None` once the
    /// underlying data is exhausted.
    fn next_block(&mut self) -> Option<Vec<Posting>>;

    /// Estimate of the total number of documents for this source.
    fn num_docs(&self) -> u64;

    /// True once every underlying posting has been produced.
    fn is_exhausted(&self) -> bool;

    /// Resolves an inlink segment to a posting for the document it
    /// references, if this source can see that document.
    fn resolve_inlink(&mut self, _segment: &[u8; SEGMENT_LEN]) -> Option<Posting> {
        None
    }
}

/// Access to stored document summaries, keyed by the byte offset
/// carried in each posting.
pub trait SummaryStore {
    fn summary(&self, offset: u64) -> Option<String>;
}

impl<T: SummaryStore + ?Sized> SummaryStore for std::sync::Arc<T> {
    fn summary(&self, offset: u64) -> Option<String> {
        (**self).summary(offset)
    }
}
