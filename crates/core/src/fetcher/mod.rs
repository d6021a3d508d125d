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

pub mod queue;
pub mod robots;
pub mod scheduler;
pub mod worker;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::config::FetcherConfig;

/// URLs popped from the queue and downloaded concurrently per loop
/// iteration.
pub const DOWNLOAD_BATCH_SIZE: usize = 50;

/// Accumulated pages that trigger a mini-index build and upload.
pub const SEEN_URLS_BEFORE_UPDATE: usize = 100;

/// The single hard backoff point: every failed scheduler or
/// coordinator round-trip sleeps this long before retrying. Fixed, no
/// exponential growth.
pub const SCHEDULER_RETRY: Duration = Duration::from_secs(5);

/// Minimum duration of one loop iteration.
pub const MIN_LOOP_PERIOD: Duration = Duration::from_secs(5);

pub const MAX_URL_LEN_BYTES: usize = 512;

pub const MAX_CONTENT_LENGTH: usize = 1_048_576;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("content too large")]
    ContentTooLarge,

    #[error("scheduler reply malformed: {0}")]
    MalformedReply(String),

    #[error("scheduler unreachable")]
    SchedulerUnreachable(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// State of the fetch loop after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Continue,
    Stop,
    NoData,
}

/// One unit of crawl work as handed out by the queue server. Failed
/// entries with zero crawl delay get exactly one retry through the
/// `to_crawl_again` queue.
#[derive(
    Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct ToCrawlEntry {
    pub url: String,
    pub weight: f32,
    pub crawl_delay: u32,
}

impl ToCrawlEntry {
    pub fn is_robots(&self) -> bool {
        self.url.ends_with("/robots.txt")
    }
}

/// Everything known about one fetched page. Created per download,
/// enriched by the page processor, consumed once by the index builder
/// and then discarded.
#[derive(Debug, Clone)]
pub struct SiteRecord {
    pub url: Url,
    pub http_status: u16,
    pub body: String,
    pub mime_type: String,
    pub lang: String,
    pub title: String,
    pub description: String,
    /// Outbound links, url to anchor text.
    pub links: BTreeMap<String, String>,
    pub server: Option<String>,
    pub weight: f32,
    pub crawl_delay: u32,
    pub is_robots: bool,
    /// Pseudo-documents (e.g. sitemaps) indexed by meta tags only.
    pub is_meta_only: bool,
    /// Only meaningful for archive re-crawls.
    pub doc_rank: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl SiteRecord {
    pub fn new(url: Url, entry: &ToCrawlEntry) -> Self {
        Self {
            url,
            http_status: 0,
            body: String::new(),
            mime_type: String::new(),
            lang: "en".to_string(),
            title: String::new(),
            description: String::new(),
            links: BTreeMap::new(),
            server: None,
            weight: entry.weight,
            crawl_delay: entry.crawl_delay,
            is_robots: entry.is_robots(),
            is_meta_only: false,
            doc_rank: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Result of one page processor run.
#[derive(Debug, Clone, Default)]
pub struct ProcessedPage {
    pub title: String,
    pub description: String,
    pub links: BTreeMap<String, String>,
    pub lang: Option<String>,
}

/// Extracts text and links from one MIME type. Failures return `None`;
/// the page is still marked visited and never reprocessed.
pub trait PageProcessor: Send + Sync {
    fn handle(&self, body: &str, url: &Url) -> Option<ProcessedPage>;
}

/// Explicit MIME type to processor mapping, populated at startup.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Box<dyn PageProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in html and plain-text processors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("text/html", Box::new(HtmlProcessor));
        registry.register("text/plain", Box::new(TextProcessor));
        registry
    }

    pub fn register(&mut self, mime_type: &str, processor: Box<dyn PageProcessor>) {
        self.processors.insert(mime_type.to_string(), processor);
    }

    pub fn handle(&self, mime_type: &str, body: &str, url: &Url) -> Option<ProcessedPage> {
        let essence = mime_type
            .parse::<mime::Mime>()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|_| mime_type.trim().to_string());

        self.processors.get(&essence)?.handle(body, url)
    }
}

/// Minimal built-in html extraction: title tag, leading text as
/// description, anchor links. Site deployments register richer
/// processors per MIME type.
pub struct HtmlProcessor;

impl PageProcessor for HtmlProcessor {
    fn handle(&self, body: &str, url: &Url) -> Option<ProcessedPage> {
        use once_cell::sync::Lazy;
        use regex::Regex;

        static TITLE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
        static ANCHOR: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
        });
        static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

        let title = TITLE
            .captures(body)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        let mut links = BTreeMap::new();
        for caps in ANCHOR.captures_iter(body) {
            let anchor = TAG.replace_all(&caps[2], " ").trim().to_string();

            if let Ok(resolved) = url.join(&caps[1]) {
                if resolved.as_str().len() <= MAX_URL_LEN_BYTES {
                    links.insert(resolved.to_string(), anchor);
                }
            }
        }

        let text = TAG.replace_all(body, " ");
        let description: String = text.split_whitespace().take(100).collect::<Vec<_>>().join(" ");

        Some(ProcessedPage {
            title,
            description,
            links,
            lang: whatlang::detect_lang(&text).map(|lang| crate::phrases::stemmer::locale_tag(lang).to_string()),
        })
    }
}

pub struct TextProcessor;

impl PageProcessor for TextProcessor {
    fn handle(&self, body: &str, _url: &Url) -> Option<ProcessedPage> {
        let mut lines = body.lines().filter(|l| !l.trim().is_empty());
        let title = lines.next().unwrap_or_default().trim().to_string();
        let description: String = body.split_whitespace().take(100).collect::<Vec<_>>().join(" ");

        Some(ProcessedPage {
            title,
            description,
            links: BTreeMap::new(),
            lang: whatlang::detect_lang(body)
                .map(|lang| crate::phrases::stemmer::locale_tag(lang).to_string()),
        })
    }
}

/// Decodes a downloaded body to UTF-8. Mismatches are recovered best
/// effort and never fail the page.
pub fn encoded_body(raw: Vec<u8>) -> String {
    match String::from_utf8(raw) {
        Ok(body) => body,
        Err(err) => {
            let raw = err.into_bytes();

            let mut detector = chardetng::EncodingDetector::new();
            detector.feed(&raw, true);
            let encoding: &'static encoding_rs::Encoding = detector.guess(None, true);

            let (cow, _, had_errors) = encoding.decode(&raw);

            if had_errors {
                tracing::debug!("lossy body decode with {}", encoding.name());
                String::from_utf8_lossy(&raw).to_string()
            } else {
                cow.into_owned()
            }
        }
    }
}

/// HTTP client shared by the fetch loop and the scheduler client.
pub fn reqwest_client(config: &FetcherConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .user_agent(&config.user_agent.full)
        .build()?)
}
