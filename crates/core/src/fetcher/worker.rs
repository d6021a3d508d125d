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

//! The fetch loop. One iteration checks for a stop file, syncs the
//! active crawl timestamp, tops the url queue up from the scheduler,
//! downloads a batch concurrently, routes pages through the processor
//! registry and periodically flushes a mini index to the coordinator.
//! No error escapes [`Fetcher::run`]; every failure degrades to a log
//! line and a retry.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use futures::StreamExt;
use tokio::time::sleep;
use url::Url;

use crate::config::FetcherConfig;
use crate::fetcher::robots::{RobotsTxt, RobotsTxtManager};
use crate::fetcher::scheduler::{BatchUpdate, SchedulerClient};
use crate::fetcher::{
    encoded_body, queue, Error, LoopState, ProcessorRegistry, Result, SiteRecord, ToCrawlEntry,
    DOWNLOAD_BATCH_SIZE, MAX_CONTENT_LENGTH, MAX_URL_LEN_BYTES, MIN_LOOP_PERIOD,
    SCHEDULER_RETRY, SEEN_URLS_BEFORE_UPDATE,
};
use crate::index::builder::IndexBuilder;

/// Presence of this file in the data dir stops the loop at the next
/// iteration boundary.
pub const STOP_FILE: &str = "stop";

pub struct Fetcher {
    config: FetcherConfig,
    client: reqwest::Client,
    scheduler: SchedulerClient,
    processors: ProcessorRegistry,
    builder: IndexBuilder,
    robots: RobotsTxtManager,

    crawl_time: u64,
    to_crawl: VecDeque<ToCrawlEntry>,
    /// One-shot retry queue, consulted only once the primary queue is
    /// empty. Entries popped from here are never re-queued.
    to_crawl_again: VecDeque<ToCrawlEntry>,

    batch: Vec<SiteRecord>,
    discovered: Vec<ToCrawlEntry>,
    seen_urls: Vec<String>,
    new_robots: Vec<(String, RobotsTxt)>,

    retry_delay: std::time::Duration,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = crate::fetcher::reqwest_client(&config)?;
        let scheduler = SchedulerClient::new(&config)?;
        let builder = IndexBuilder::new(&config.url_class_tags)?;
        let robots = RobotsTxtManager::new(std::time::Duration::from_secs(
            config.robots_txt_cache_sec,
        ));

        Ok(Self {
            config,
            client,
            scheduler,
            processors: ProcessorRegistry::with_defaults(),
            builder,
            robots,
            crawl_time: 0,
            to_crawl: VecDeque::new(),
            to_crawl_again: VecDeque::new(),
            batch: Vec::new(),
            discovered: Vec::new(),
            seen_urls: Vec::new(),
            new_robots: Vec::new(),
            retry_delay: SCHEDULER_RETRY,
        })
    }

    pub async fn run(mut self) {
        tracing::info!("fetcher loop started");

        loop {
            let started = Instant::now();

            match self.step().await {
                LoopState::Stop => break,
                LoopState::NoData => {
                    tracing::debug!("no work available");
                }
                LoopState::Continue => {}
            }

            if let Some(remaining) = MIN_LOOP_PERIOD.checked_sub(started.elapsed()) {
                sleep(remaining).await;
            }
        }

        tracing::info!("fetcher loop stopped");
    }

    async fn step(&mut self) -> LoopState {
        if self.stop_requested() {
            tracing::info!("stop file present");
            return LoopState::Stop;
        }

        match self.scheduler.crawl_time().await {
            Ok(time) => self.switch_crawl(time),
            Err(err) => {
                tracing::warn!("crawl time check failed: {}", err);
                sleep(self.retry_delay).await;
                return LoopState::Continue;
            }
        }

        if self.to_crawl.is_empty() && self.to_crawl_again.is_empty() {
            match self.acquire_batch().await {
                Ok(true) => {}
                Ok(false) => {
                    self.flush_if_due().await;
                    return LoopState::NoData;
                }
                Err(err) => {
                    tracing::warn!("scheduler unavailable: {}", err);
                    sleep(self.retry_delay).await;
                    return LoopState::Continue;
                }
            }
        }

        let (entries, from_retry_queue) = self.pop_batch();
        if !entries.is_empty() {
            self.download_batch(entries, from_retry_queue).await;
        }

        self.flush_if_due().await;

        LoopState::Continue
    }

    fn stop_requested(&self) -> bool {
        self.config.data_dir.join(STOP_FILE).exists()
    }

    /// On a crawl timestamp change the old queue is persisted under
    /// its own timestamp, unsent buffers are dropped, and any queue
    /// previously persisted for the new crawl is restored.
    fn switch_crawl(&mut self, time: u64) {
        if time == self.crawl_time {
            return;
        }

        tracing::info!(old = self.crawl_time, new = time, "crawl time changed");

        if self.crawl_time != 0 {
            if let Err(err) = queue::persist(&self.config.data_dir, self.crawl_time, &self.to_crawl)
            {
                tracing::warn!("failed to persist queue: {}", err);
            }
        }

        self.to_crawl = queue::restore(&self.config.data_dir, time);
        self.to_crawl_again.clear();
        self.batch.clear();
        self.discovered.clear();
        self.seen_urls.clear();
        self.new_robots.clear();
        self.crawl_time = time;
    }

    /// Asks the scheduler for fresh work. `Ok(true)` means urls were
    /// queued.
    async fn acquire_batch(&mut self) -> Result<bool> {
        let Some((params, entries)) = self.scheduler.fetch_batch().await? else {
            return Ok(false);
        };

        if params.crawl_time != 0 {
            self.switch_crawl(params.crawl_time);
        }

        tracing::info!(urls = entries.len(), "received schedule batch");
        self.to_crawl.extend(entries);

        if let Err(err) = queue::persist(&self.config.data_dir, self.crawl_time, &self.to_crawl) {
            tracing::warn!("failed to persist queue: {}", err);
        }

        Ok(!self.to_crawl.is_empty())
    }

    /// Pops up to one download batch. Politeness: at most one url per
    /// host with a nonzero crawl delay per batch; the rest stay
    /// queued. Falls back to the one-shot retry queue when the
    /// primary queue is empty.
    fn pop_batch(&mut self) -> (Vec<ToCrawlEntry>, bool) {
        let from_retry_queue = self.to_crawl.is_empty();
        let queue = if from_retry_queue {
            &mut self.to_crawl_again
        } else {
            &mut self.to_crawl
        };

        let mut entries = Vec::new();
        let mut delayed_hosts = BTreeSet::new();
        let mut skipped = VecDeque::new();

        while entries.len() < DOWNLOAD_BATCH_SIZE {
            let Some(entry) = queue.pop_front() else {
                break;
            };

            let host = Url::parse(&entry.url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();

            if entry.crawl_delay > 0 && !delayed_hosts.insert(host) {
                skipped.push_back(entry);
                continue;
            }

            entries.push(entry);
        }

        while let Some(entry) = skipped.pop_back() {
            queue.push_front(entry);
        }

        (entries, from_retry_queue)
    }

    async fn download_batch(&mut self, entries: Vec<ToCrawlEntry>, from_retry_queue: bool) {
        let client = self.client.clone();

        let results: Vec<(ToCrawlEntry, Result<SiteRecord>)> = futures::stream::iter(entries)
            .map(|entry| {
                let client = client.clone();
                async move {
                    let result = download(&client, &entry).await;
                    (entry, result)
                }
            })
            .buffer_unordered(DOWNLOAD_BATCH_SIZE)
            .collect()
            .await;

        for (entry, result) in results {
            match result {
                Ok(record) if record.http_status == 429 => {
                    // slow down; one more try with a raised delay
                    if !from_retry_queue {
                        let mut entry = entry;
                        entry.crawl_delay = entry.crawl_delay.max(1) * 2;
                        self.to_crawl_again.push_back(entry);
                    }
                }
                Ok(record) => self.process_download(record),
                Err(err) => {
                    tracing::debug!(url = %entry.url, "download failed: {}", err);

                    if entry.crawl_delay == 0 && !from_retry_queue {
                        self.to_crawl_again.push_back(entry);
                    }
                }
            }
        }
    }

    /// Routes one downloaded record: robots files feed the robots
    /// cache and upload buffer, pages go through the processor
    /// registry. A processor returning nothing still marks the url
    /// seen so it is never refetched.
    fn process_download(&mut self, mut record: SiteRecord) {
        self.seen_urls.push(record.url.to_string());

        if record.is_robots {
            let robots = RobotsTxt::parse(
                &self.config.user_agent.token,
                &record.body,
                self.config.max_crawl_delay_secs,
                Some(&record.url),
            );

            for sitemap in &robots.sitemaps {
                self.discovered.push(ToCrawlEntry {
                    url: sitemap.clone(),
                    weight: record.weight,
                    crawl_delay: robots.crawl_delay.unwrap_or(0),
                });
            }

            let host = record.host().to_string();
            self.robots.insert(&host, robots.clone());
            self.new_robots.push((host, robots));
            return;
        }

        if !self.robots.is_allowed(&record.url) {
            tracing::debug!(url = %record.url, "disallowed by robots directives");
            return;
        }

        let Some(page) = self
            .processors
            .handle(&record.mime_type, &record.body, &record.url)
        else {
            tracing::debug!(url = %record.url, mime = %record.mime_type, "no processor output");
            return;
        };

        record.title = page.title;
        record.description = page.description;
        record.links = page.links;
        if let Some(lang) = page.lang {
            record.lang = lang;
        }

        let crawl_delay = self.robots.crawl_delay(&record.url).unwrap_or(0);
        for link in record.links.keys() {
            if link.len() <= MAX_URL_LEN_BYTES {
                self.discovered.push(ToCrawlEntry {
                    url: link.clone(),
                    weight: record.weight / 2.0,
                    crawl_delay,
                });
            }
        }

        self.batch.push(record);
    }

    /// Anything buffered for the coordinator: indexable pages, robots
    /// directives, discovered links or seen-url marks.
    fn update_pending(&self) -> bool {
        !self.batch.is_empty()
            || !self.new_robots.is_empty()
            || !self.discovered.is_empty()
            || !self.seen_urls.is_empty()
    }

    /// The build is triggered by the accumulated seen-url count, not
    /// the page count: robots fetches and processor-less pages also
    /// carry data the coordinator is waiting for. A drained queue
    /// flushes whatever partial buffers remain.
    fn flush_due(&self) -> bool {
        if self.seen_urls.len() >= SEEN_URLS_BEFORE_UPDATE {
            return true;
        }

        self.to_crawl.is_empty() && self.to_crawl_again.is_empty() && self.update_pending()
    }

    /// Builds and uploads a mini index once due. The upload is retried
    /// forever; the queue is only persisted after a successful ack.
    async fn flush_if_due(&mut self) {
        if !self.flush_due() {
            return;
        }

        let records = std::mem::take(&mut self.batch);
        let fragment = self.builder.build(records);

        let update = BatchUpdate {
            crawl_time: self.crawl_time,
            robots: std::mem::take(&mut self.new_robots),
            discovered: std::mem::take(&mut self.discovered),
            seen_urls: std::mem::take(&mut self.seen_urls),
        };

        tracing::info!(
            docs = fragment.num_docs(),
            terms = fragment.num_terms(),
            "uploading mini index"
        );

        loop {
            match self.scheduler.send_update(&update, &fragment).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!("update upload failed, retrying: {}", err);
                    sleep(self.retry_delay).await;
                }
            }
        }

        if let Err(err) = queue::persist(&self.config.data_dir, self.crawl_time, &self.to_crawl) {
            tracing::warn!("failed to persist queue: {}", err);
        }
    }
}

/// Downloads one url. Non-2xx statuses still produce a record (the
/// page is processed anyway to avoid permanent re-crawl loops); only
/// network level failures are reported as errors.
async fn download(client: &reqwest::Client, entry: &ToCrawlEntry) -> Result<SiteRecord> {
    let url = Url::parse(&entry.url).map_err(|err| Error::Other(err.into()))?;

    let response = client.get(url.clone()).send().await?;

    if response
        .content_length()
        .is_some_and(|len| len as usize > MAX_CONTENT_LENGTH)
    {
        return Err(Error::ContentTooLarge);
    }

    let mut record = SiteRecord::new(url, entry);
    record.http_status = response.status().as_u16();
    record.mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/html")
        .to_string();
    record.server = response
        .headers()
        .get(reqwest::header::SERVER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut raw = response.bytes().await?.to_vec();
    if raw.len() > MAX_CONTENT_LENGTH {
        tracing::debug!(url = %record.url, "truncating oversized body");
        raw.truncate(MAX_CONTENT_LENGTH);
    }

    record.body = encoded_body(raw);

    if record.http_status >= 300 {
        tracing::debug!(url = %record.url, status = record.http_status, "non-success status");
    }

    Ok(record)
}
