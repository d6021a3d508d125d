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

pub mod builder;
pub mod shard;

/// Byte length of one segment of a [`DocKey`]. The shard store slices
/// keys at multiples of this constant, so it must never change without
/// rebuilding every shard.
pub const SEGMENT_LEN: usize = 8;

/// Fixed-width composite document identifier.
///
/// Three positionally fixed segments: a URL hash that groups postings
/// referring to the same page, a content hash that detects duplicate
/// content across URLs, and an inlink hash derived from the host that
/// keys link-anchor pseudo-documents against the page they point to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct DocKey([u8; 3 * SEGMENT_LEN]);

fn hash_segment<T: AsRef<[u8]>>(val: T) -> [u8; SEGMENT_LEN] {
    let digest = md5::compute(val);
    let mut segment = [0u8; SEGMENT_LEN];
    segment.copy_from_slice(&digest[..SEGMENT_LEN]);
    segment
}

/// Hash of `host + "/"` shifted by one byte. Used as the inlink
/// segment so that link pseudo-documents and the page they reference
/// agree on it without colliding with plain URL hashes.
fn inlink_segment(host: &str) -> [u8; SEGMENT_LEN] {
    let digest = md5::compute(format!("{host}/"));
    let mut segment = [0u8; SEGMENT_LEN];
    segment.copy_from_slice(&digest[1..SEGMENT_LEN + 1]);
    segment
}

impl DocKey {
    pub fn new(url: &str, content: &str, host: &str) -> Self {
        Self::from_segments(hash_segment(url), hash_segment(content), inlink_segment(host))
    }

    /// Key for a link-anchor pseudo-document. The URL segment comes
    /// from the link id (so every link gets a distinct posting) while
    /// the inlink segment points at the linked host.
    pub fn for_link(link_id: &str, anchor: &str, target_host: &str) -> Self {
        Self::from_segments(
            hash_segment(link_id),
            hash_segment(anchor),
            inlink_segment(target_host),
        )
    }

    pub fn from_segments(
        url: [u8; SEGMENT_LEN],
        content: [u8; SEGMENT_LEN],
        inlink: [u8; SEGMENT_LEN],
    ) -> Self {
        let mut bytes = [0u8; 3 * SEGMENT_LEN];
        bytes[..SEGMENT_LEN].copy_from_slice(&url);
        bytes[SEGMENT_LEN..2 * SEGMENT_LEN].copy_from_slice(&content);
        bytes[2 * SEGMENT_LEN..].copy_from_slice(&inlink);
        Self(bytes)
    }

    pub fn url_segment(&self) -> [u8; SEGMENT_LEN] {
        self.0[..SEGMENT_LEN].try_into().unwrap()
    }

    pub fn content_segment(&self) -> [u8; SEGMENT_LEN] {
        self.0[SEGMENT_LEN..2 * SEGMENT_LEN].try_into().unwrap()
    }

    pub fn inlink_segment(&self) -> [u8; SEGMENT_LEN] {
        self.0[2 * SEGMENT_LEN..].try_into().unwrap()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
