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

pub struct Fetcher;

impl Fetcher {
    pub fn robot_instance() -> String {
        "fetcher-0".to_string()
    }

    pub fn machine_uri() -> String {
        "http://localhost/".to_string()
    }

    pub fn data_dir() -> std::path::PathBuf {
        "data".into()
    }

    pub fn timeout_seconds() -> u64 {
        10
    }

    pub fn max_crawl_delay_secs() -> u32 {
        60
    }

    pub fn robots_txt_cache_sec() -> u64 {
        60 * 60
    }

    pub fn url_class_tags() -> Vec<super::UrlClassTag> {
        Vec::new()
    }
}
