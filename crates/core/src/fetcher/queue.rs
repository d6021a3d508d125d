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

//! Crash-recovery persistence for the url queue. One file per crawl
//! timestamp so a fetcher restarted mid-crawl, or switched between
//! crawls, picks up where it left off. Unreadable or missing files
//! mean "start fresh" and never fail the loop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::fetcher::ToCrawlEntry;

fn queue_path(data_dir: &Path, crawl_time: u64) -> PathBuf {
    data_dir.join(format!("queue-{crawl_time}.bin"))
}

/// Best-effort permission widening so a restarted process running as
/// a different user can still recover the queue.
fn widen_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666));
    }
}

pub fn persist(data_dir: &Path, crawl_time: u64, queue: &VecDeque<ToCrawlEntry>) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;

    let entries: Vec<&ToCrawlEntry> = queue.iter().collect();
    let bytes = bincode::encode_to_vec(&entries, bincode::config::standard())?;

    let path = queue_path(data_dir, crawl_time);
    std::fs::write(&path, bytes)?;
    widen_permissions(&path);

    Ok(())
}

/// Restores the persisted queue for a crawl. Corrupt or absent files
/// restore as empty.
pub fn restore(data_dir: &Path, crawl_time: u64) -> VecDeque<ToCrawlEntry> {
    let path = queue_path(data_dir, crawl_time);

    let Ok(bytes) = std::fs::read(&path) else {
        return VecDeque::new();
    };

    match bincode::decode_from_slice::<Vec<ToCrawlEntry>, _>(&bytes, bincode::config::standard()) {
        Ok((entries, _)) => entries.into(),
        Err(err) => {
            tracing::warn!("discarding corrupt queue file {}: {}", path.display(), err);
            VecDeque::new()
        }
    }
}

pub fn remove(data_dir: &Path, crawl_time: u64) {
    let _ = std::fs::remove_file(queue_path(data_dir, crawl_time));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("trawler-queue-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(url: &str) -> ToCrawlEntry {
        ToCrawlEntry {
            url: url.to_string(),
            weight: 1.5,
            crawl_delay: 2,
        }
    }

    #[test]
    fn round_trip() {
        let dir = temp_dir();
        let queue: VecDeque<ToCrawlEntry> =
            vec![entry("https://a.com/"), entry("https://b.com/")].into();

        persist(&dir, 42, &queue).unwrap();

        assert_eq!(restore(&dir, 42), queue);
    }

    #[test]
    fn missing_file_restores_empty() {
        let dir = temp_dir();

        assert!(restore(&dir, 7).is_empty());
    }

    #[test]
    fn corrupt_file_restores_empty() {
        let dir = temp_dir();
        std::fs::write(queue_path(&dir, 9), b"not a queue").unwrap();

        assert!(restore(&dir, 9).is_empty());
    }

    #[test]
    fn queues_keyed_by_crawl_time() {
        let dir = temp_dir();
        let first: VecDeque<ToCrawlEntry> = vec![entry("https://a.com/")].into();
        let second: VecDeque<ToCrawlEntry> = vec![entry("https://b.com/")].into();

        persist(&dir, 1, &first).unwrap();
        persist(&dir, 2, &second).unwrap();

        assert_eq!(restore(&dir, 1), first);
        assert_eq!(restore(&dir, 2), second);

        remove(&dir, 1);
        assert!(restore(&dir, 1).is_empty());
    }

    proptest! {
        #[test]
        fn prop_round_trip(urls: Vec<String>) {
            let dir = temp_dir();
            let queue: VecDeque<ToCrawlEntry> = urls
                .into_iter()
                .map(|url| ToCrawlEntry { url, weight: 0.0, crawl_delay: 0 })
                .collect();

            persist(&dir, 3, &queue).unwrap();
            prop_assert_eq!(restore(&dir, 3), queue);
        }
    }
}
