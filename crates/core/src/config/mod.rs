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

pub mod defaults;

use std::path::{Path, PathBuf};

use anyhow::Result;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct UserAgent {
    pub full: String,
    pub token: String,
}

/// Tags documents whose URL matches `pattern` with `class:<class>`.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct UrlClassTag {
    pub pattern: String,
    pub class: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct FetcherConfig {
    pub queue_server_url: String,
    pub secret: String,
    pub user_agent: UserAgent,

    #[serde(default = "defaults::Fetcher::robot_instance")]
    pub robot_instance: String,

    #[serde(default = "defaults::Fetcher::machine_uri")]
    pub machine_uri: String,

    #[serde(default = "defaults::Fetcher::data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "defaults::Fetcher::timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "defaults::Fetcher::max_crawl_delay_secs")]
    pub max_crawl_delay_secs: u32,

    #[serde(default = "defaults::Fetcher::robots_txt_cache_sec")]
    pub robots_txt_cache_sec: u64,

    #[serde(default = "defaults::Fetcher::url_class_tags")]
    pub url_class_tags: Vec<UrlClassTag>,
}

pub fn load_fetcher_config(path: &Path) -> Result<FetcherConfig> {
    let raw = std::fs::read_to_string(path)?;

    Ok(toml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: FetcherConfig = toml::from_str(
            r#"
            queue_server_url = "http://queue.example.com/fetch"
            secret = "sesame"

            [user_agent]
            full = "Mozilla/5.0 (compatible; TrawlerBot/0.1)"
            token = "TrawlerBot"
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout_seconds, 10);
        assert_eq!(config.max_crawl_delay_secs, 60);
        assert_eq!(config.robot_instance, "fetcher-0");
        assert!(config.url_class_tags.is_empty());
    }

    #[test]
    fn url_class_tags_parsed() {
        let config: FetcherConfig = toml::from_str(
            r#"
            queue_server_url = "http://queue.example.com/fetch"
            secret = "sesame"

            [user_agent]
            full = "TrawlerBot/0.1"
            token = "TrawlerBot"

            [[url_class_tags]]
            pattern = "/news/"
            class = "news"
            "#,
        )
        .unwrap();

        assert_eq!(config.url_class_tags.len(), 1);
        assert_eq!(config.url_class_tags[0].class, "news");
    }

    #[test]
    fn missing_required_field_fails() {
        assert!(toml::from_str::<FetcherConfig>("secret = \"x\"").is_err());
    }
}
