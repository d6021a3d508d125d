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

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use url::Url;

use crate::fetcher::MAX_URL_LEN_BYTES;

/// Directives of one robots.txt file that apply to us.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct RobotsTxt {
    pub disallow: Vec<String>,
    pub allow: Vec<String>,
    pub crawl_delay: Option<u32>,
    /// Harvested `Sitemap:` URLs, crawled as extra links.
    pub sitemaps: Vec<String>,
}

impl RobotsTxt {
    /// Line-based parse. `User-agent` lines toggle whether the
    /// following directives apply to us; a crawl delay beyond
    /// `max_crawl_delay_secs` converts the whole site into a full
    /// disallow instead of storing the excessive delay.
    pub fn parse(
        agent_token: &str,
        body: &str,
        max_crawl_delay_secs: u32,
        source: Option<&Url>,
    ) -> Self {
        let mut robots = RobotsTxt::default();
        let mut applies = false;
        let mut excessive_delay = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };

            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    applies = value == "*" || value.eq_ignore_ascii_case(agent_token);
                }
                "disallow" if applies && !value.is_empty() => {
                    robots.disallow.push(value.to_string());
                }
                "allow" if applies && !value.is_empty() => {
                    robots.allow.push(value.to_string());
                }
                "crawl-delay" if applies => {
                    match value.parse::<f64>() {
                        Ok(delay) if delay > max_crawl_delay_secs as f64 => {
                            excessive_delay = true;
                        }
                        Ok(delay) if delay >= 0.0 => {
                            robots.crawl_delay = Some(delay.ceil() as u32);
                        }
                        _ => {}
                    }
                }
                "sitemap" => {
                    if value.len() > MAX_URL_LEN_BYTES {
                        continue;
                    }

                    if let Some(source) = source {
                        if value == source.as_str() {
                            continue;
                        }
                    }

                    robots.sitemaps.push(value.to_string());
                }
                _ => {}
            }
        }

        if excessive_delay {
            robots.disallow = vec!["/".to_string()];
            robots.allow.clear();
            robots.crawl_delay = None;
        }

        robots
    }

    /// Longest matching prefix wins between allow and disallow.
    pub fn is_allowed(&self, url: &Url) -> bool {
        let path = url.path();

        let disallow = self
            .disallow
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max();

        let Some(disallow) = disallow else {
            return true;
        };

        self.allow
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max()
            .map(|allow| allow >= disallow)
            .unwrap_or(false)
    }
}

struct CachedRobots {
    robots: RobotsTxt,
    last_check: Instant,
}

/// Per-site robots cache fed by the fetch loop as robots.txt downloads
/// come back. Unknown hosts are allowed; the scheduler is responsible
/// for sending the robots.txt URL ahead of the site's pages.
pub struct RobotsTxtManager {
    cache: BTreeMap<String, CachedRobots>,
    expiration: Duration,
}

impl RobotsTxtManager {
    pub fn new(expiration: Duration) -> Self {
        Self {
            cache: BTreeMap::new(),
            expiration,
        }
    }

    pub fn insert(&mut self, host: &str, robots: RobotsTxt) {
        self.cache.insert(
            host.to_string(),
            CachedRobots {
                robots,
                last_check: Instant::now(),
            },
        );
    }

    fn get(&mut self, host: &str) -> Option<&RobotsTxt> {
        let expired = self
            .cache
            .get(host)
            .map(|c| c.last_check.elapsed() >= self.expiration)
            .unwrap_or(false);

        if expired {
            self.cache.remove(host);
        }

        self.cache.get(host).map(|c| &c.robots)
    }

    pub fn is_allowed(&mut self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default().to_string();

        match self.get(&host) {
            Some(robots) => robots.is_allowed(url),
            None => true,
        }
    }

    pub fn crawl_delay(&mut self, url: &Url) -> Option<u32> {
        let host = url.host_str().unwrap_or_default().to_string();

        self.get(&host).and_then(|robots| robots.crawl_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT: &str = "TrawlerBot";

    #[test]
    fn simple() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"User-agent: TrawlerBot
            Disallow: /test"#,
            60,
            None,
        );

        assert!(!robots.is_allowed(&Url::parse("http://example.com/test").unwrap()));
        assert!(robots.is_allowed(&Url::parse("http://example.com/example").unwrap()));
    }

    #[test]
    fn agent_match_is_case_insensitive() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"User-agent: trawlerbot
            Disallow: /test"#,
            60,
            None,
        );

        assert!(!robots.is_allowed(&Url::parse("http://example.com/test").unwrap()));
    }

    #[test]
    fn directives_for_other_agents_ignored() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"User-agent: GoogleBot
Disallow: /

User-agent: TrawlerBot
Disallow: /private"#,
            60,
            None,
        );

        assert!(robots.is_allowed(&Url::parse("http://example.com/public").unwrap()));
        assert!(!robots.is_allowed(&Url::parse("http://example.com/private/x").unwrap()));
    }

    #[test]
    fn allow_overrides_shorter_disallow() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"User-agent: *
Disallow: /dir
Allow: /dir/public"#,
            60,
            None,
        );

        assert!(!robots.is_allowed(&Url::parse("http://example.com/dir/secret").unwrap()));
        assert!(robots.is_allowed(&Url::parse("http://example.com/dir/public/a").unwrap()));
    }

    #[test]
    fn excessive_crawl_delay_disallows_site() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"User-agent: *
Crawl-delay: 999999
Disallow: /cgi"#,
            60,
            None,
        );

        assert_eq!(robots.disallow, vec!["/".to_string()]);
        assert_eq!(robots.crawl_delay, None);
        assert!(!robots.is_allowed(&Url::parse("http://example.com/anything").unwrap()));
    }

    #[test]
    fn reasonable_crawl_delay_stored() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"User-agent: *
Crawl-delay: 10"#,
            60,
            None,
        );

        assert_eq!(robots.crawl_delay, Some(10));
    }

    #[test]
    fn sitemaps_harvested_anywhere() {
        let robots = RobotsTxt::parse(
            AGENT,
            r#"Sitemap: http://example.com/sitemap.xml
User-agent: OtherBot
Disallow: /
SiTeMaP: http://example.com/sitemap2.xml"#,
            60,
            None,
        );

        assert_eq!(
            robots.sitemaps,
            vec![
                "http://example.com/sitemap.xml".to_string(),
                "http://example.com/sitemap2.xml".to_string()
            ]
        );
    }

    #[test]
    fn self_referencing_sitemap_skipped() {
        let source = Url::parse("http://example.com/robots.txt").unwrap();
        let robots = RobotsTxt::parse(
            AGENT,
            "Sitemap: http://example.com/robots.txt",
            60,
            Some(&source),
        );

        assert!(robots.sitemaps.is_empty());
    }

    #[test]
    fn oversized_sitemap_url_skipped() {
        let long_url = format!("http://example.com/{}", "a".repeat(MAX_URL_LEN_BYTES));
        let robots = RobotsTxt::parse(AGENT, &format!("Sitemap: {long_url}"), 60, None);

        assert!(robots.sitemaps.is_empty());
    }

    #[test]
    fn manager_expires_entries() {
        let mut manager = RobotsTxtManager::new(Duration::from_millis(10));
        let url = Url::parse("http://example.com/test").unwrap();

        manager.insert(
            "example.com",
            RobotsTxt {
                disallow: vec!["/test".to_string()],
                ..Default::default()
            },
        );

        assert!(!manager.is_allowed(&url));

        std::thread::sleep(Duration::from_millis(20));

        // expired entries fall back to allowed
        assert!(manager.is_allowed(&url));
    }

    #[test]
    fn unknown_host_is_allowed() {
        let mut manager = RobotsTxtManager::new(Duration::from_secs(60));

        assert!(manager.is_allowed(&Url::parse("http://nowhere.com/").unwrap()));
    }
}
