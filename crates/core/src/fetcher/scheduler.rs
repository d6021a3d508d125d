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

//! HTTP client for the queue server. Three calls: `crawl_time` returns
//! the active crawl timestamp, `fetch_batch` hands out a batch of urls
//! to crawl, `send_update` uploads crawl results. Every request carries
//! a session token derived from the shared secret.
//!
//! The schedule reply is newline-delimited: the first line is a
//! base64 JSON map of crawl parameters, every further line is
//! `base64(f32 BE weight ‖ i32 BE crawl_delay ‖ raw url bytes)`.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::FetcherConfig;
use crate::fetcher::robots::RobotsTxt;
use crate::fetcher::{Error, Result, ToCrawlEntry};
use crate::index::shard::ShardFragment;

/// Global parameters of the active crawl, sent as the first line of
/// every schedule reply.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CrawlParams {
    #[serde(default)]
    pub crawl_time: u64,

    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Crawl results of one upload: discovered links and robots directives
/// for the scheduler, plus the serialized shard fragment for the
/// indexer.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct BatchUpdate {
    pub crawl_time: u64,
    pub robots: Vec<(String, RobotsTxt)>,
    pub discovered: Vec<ToCrawlEntry>,
    pub seen_urls: Vec<String>,
}

pub struct SchedulerClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
    robot_instance: String,
    machine_uri: String,
}

impl SchedulerClient {
    pub fn new(config: &FetcherConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: crate::fetcher::reqwest_client(config)?,
            base_url: config.queue_server_url.clone(),
            secret: config.secret.clone(),
            robot_instance: config.robot_instance.clone(),
            machine_uri: config.machine_uri.clone(),
        })
    }

    fn request_url(&self, action: &str) -> String {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        format!(
            "{}?c=fetch&a={}&time={}&session={}&robot_instance={}&machine_uri={}",
            self.base_url,
            action,
            time,
            session_token(time, &self.secret),
            self.robot_instance,
            self.machine_uri,
        )
    }

    /// Timestamp of the crawl the queue server is currently handing
    /// out work for.
    pub async fn crawl_time(&self) -> Result<u64> {
        let body = self
            .client
            .get(self.request_url("crawlTime"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        body.trim()
            .parse::<u64>()
            .map_err(|_| Error::MalformedReply(format!("crawl time {body:?}")))
    }

    /// Asks for a fresh batch of urls. `Ok(None)` means the scheduler
    /// has no work right now.
    pub async fn fetch_batch(&self) -> Result<Option<(CrawlParams, Vec<ToCrawlEntry>)>> {
        let body = self
            .client
            .get(self.request_url("schedule"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if body.trim().is_empty() {
            return Ok(None);
        }

        parse_schedule_reply(&body).map(Some)
    }

    /// Uploads crawl results. The shard fragment travels uncompressed
    /// behind a length-framed gzipped summary blob so the coordinator
    /// can split summaries from postings without deserializing either.
    pub async fn send_update(&self, update: &BatchUpdate, fragment: &ShardFragment) -> Result<()> {
        let robot_data = encode_compressed(&update.robots)?;
        let schedule_data = encode_compressed(&(&update.discovered, &update.seen_urls))?;
        let index_data = encode_index_data(fragment)?;

        let form = reqwest::multipart::Form::new()
            .text("crawl_time", update.crawl_time.to_string())
            .text("robot_data", robot_data)
            .text("schedule_data", schedule_data)
            .part(
                "index_data",
                reqwest::multipart::Part::bytes(index_data).file_name("index_data"),
            );

        self.client
            .post(self.request_url("update"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Shared-secret authentication token, recomputed per request so a
/// captured token expires with its timestamp.
pub(crate) fn session_token(time: u64, secret: &str) -> String {
    format!("{:x}", md5::compute(format!("{time}{secret}")))
}

/// Parses a full schedule reply body. Malformed url lines are skipped
/// with a debug log rather than failing the batch.
pub fn parse_schedule_reply(body: &str) -> Result<(CrawlParams, Vec<ToCrawlEntry>)> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());

    let first = lines
        .next()
        .ok_or_else(|| Error::MalformedReply("empty schedule reply".to_string()))?;

    let params_bytes = BASE64
        .decode(first.trim())
        .map_err(|err| Error::MalformedReply(format!("params line: {err}")))?;
    let params: CrawlParams = serde_json::from_slice(&params_bytes)
        .map_err(|err| Error::MalformedReply(format!("params json: {err}")))?;

    let mut entries = Vec::new();
    for line in lines {
        match decode_batch_line(line.trim()) {
            Ok(entry) => entries.push(entry),
            Err(err) => tracing::debug!("skipping malformed schedule line: {}", err),
        }
    }

    Ok((params, entries))
}

pub(crate) fn decode_batch_line(line: &str) -> Result<ToCrawlEntry> {
    let bytes = BASE64
        .decode(line)
        .map_err(|err| Error::MalformedReply(format!("batch line base64: {err}")))?;

    if bytes.len() < 8 {
        return Err(Error::MalformedReply(format!(
            "batch line too short: {} bytes",
            bytes.len()
        )));
    }

    let weight = f32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let crawl_delay = i32::from_be_bytes(bytes[4..8].try_into().unwrap()).max(0) as u32;
    let url = String::from_utf8(bytes[8..].to_vec())
        .map_err(|err| Error::MalformedReply(format!("batch line url: {err}")))?;

    Ok(ToCrawlEntry {
        url,
        weight,
        crawl_delay,
    })
}

pub(crate) fn encode_batch_line(entry: &ToCrawlEntry) -> String {
    let mut bytes = Vec::with_capacity(8 + entry.url.len());
    bytes.extend_from_slice(&entry.weight.to_be_bytes());
    bytes.extend_from_slice(&(entry.crawl_delay as i32).to_be_bytes());
    bytes.extend_from_slice(entry.url.as_bytes());

    BASE64.encode(bytes)
}

fn encode_compressed<T: bincode::Encode>(value: &T) -> Result<String> {
    let bytes = bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| Error::Other(err.into()))?;

    Ok(BASE64.encode(gzip(&bytes)?))
}

/// `packed u32 length ‖ gzip(summary blob) ‖ raw fragment bytes`.
pub(crate) fn encode_index_data(fragment: &ShardFragment) -> Result<Vec<u8>> {
    let summaries = gzip(fragment.summary_bytes())?;
    let fragment_bytes = fragment.serialize().map_err(Error::Other)?;

    let mut framed = Vec::with_capacity(4 + summaries.len() + fragment_bytes.len());
    framed.extend_from_slice(&(summaries.len() as u32).to_be_bytes());
    framed.extend_from_slice(&summaries);
    framed.extend_from_slice(&fragment_bytes);

    Ok(framed)
}

#[cfg(test)]
pub(crate) fn decode_index_data(framed: &[u8]) -> Result<(Vec<u8>, ShardFragment)> {
    if framed.len() < 4 {
        return Err(Error::MalformedReply("index data too short".to_string()));
    }

    let len = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
    if framed.len() < 4 + len {
        return Err(Error::MalformedReply("index data truncated".to_string()));
    }

    let summaries = gunzip(&framed[4..4 + len])?;
    let fragment = ShardFragment::deserialize(&framed[4 + len..]).map_err(Error::Other)?;

    Ok((summaries, fragment))
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|err| Error::Other(err.into()))
}

#[cfg(test)]
fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|err| Error::Other(err.into()))?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, weight: f32, crawl_delay: u32) -> ToCrawlEntry {
        ToCrawlEntry {
            url: url.to_string(),
            weight,
            crawl_delay,
        }
    }

    #[test]
    fn batch_line_round_trip() {
        let original = entry("https://example.com/page?x=1", 0.75, 10);

        let decoded = decode_batch_line(&encode_batch_line(&original)).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn batch_line_layout_is_fixed() {
        let line = encode_batch_line(&entry("http://a.com/", 1.0, 2));
        let bytes = BASE64.decode(line).unwrap();

        assert_eq!(f32::from_be_bytes(bytes[0..4].try_into().unwrap()), 1.0);
        assert_eq!(i32::from_be_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(&bytes[8..], b"http://a.com/");
    }

    #[test]
    fn negative_crawl_delay_clamped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.0f32.to_be_bytes());
        bytes.extend_from_slice(&(-5i32).to_be_bytes());
        bytes.extend_from_slice(b"http://a.com/");

        let entry = decode_batch_line(&BASE64.encode(bytes)).unwrap();

        assert_eq!(entry.crawl_delay, 0);
    }

    #[test]
    fn schedule_reply_parsed() {
        let params = CrawlParams {
            crawl_time: 1_700_000_000,
            params: maplit::btreemap! {
                "pages_per_host".to_string() => "50".to_string(),
            },
        };

        let body = format!(
            "{}\n{}\n{}\n",
            BASE64.encode(serde_json::to_vec(&params).unwrap()),
            encode_batch_line(&entry("https://a.com/robots.txt", 1.0, 0)),
            encode_batch_line(&entry("https://a.com/", 0.5, 3)),
        );

        let (parsed_params, entries) = parse_schedule_reply(&body).unwrap();

        assert_eq!(parsed_params.crawl_time, 1_700_000_000);
        assert_eq!(parsed_params.params["pages_per_host"], "50");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_robots());
        assert_eq!(entries[1].url, "https://a.com/");
        assert_eq!(entries[1].crawl_delay, 3);
    }

    #[test]
    fn malformed_lines_skipped() {
        let params = CrawlParams::default();
        let body = format!(
            "{}\nnot base64!!!\n{}\n",
            BASE64.encode(serde_json::to_vec(&params).unwrap()),
            encode_batch_line(&entry("https://b.com/", 1.0, 0)),
        );

        let (_, entries) = parse_schedule_reply(&body).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://b.com/");
    }

    #[test]
    fn malformed_params_line_is_an_error() {
        assert!(matches!(
            parse_schedule_reply("!!!\n"),
            Err(Error::MalformedReply(_))
        ));
        assert!(matches!(
            parse_schedule_reply(""),
            Err(Error::MalformedReply(_))
        ));
    }

    #[test]
    fn index_data_framing_round_trip() {
        let mut fragment = ShardFragment::new();
        let offset = fragment.add_summary("A Title", "a description");
        fragment.add_document_words(
            crate::index::DocKey::new("https://a.com/", "body", "a.com"),
            None,
            &maplit::btreemap! { "titl".to_string() => vec![0] },
            &[],
            offset,
            1,
            false,
        );

        let framed = encode_index_data(&fragment).unwrap();
        let (summaries, decoded) = decode_index_data(&framed).unwrap();

        assert_eq!(summaries, fragment.summary_bytes());
        assert_eq!(decoded.num_docs(), fragment.num_docs());
    }

    #[test]
    fn session_token_binds_time_and_secret() {
        assert_eq!(
            session_token(1234, "sesame"),
            format!("{:x}", md5::compute("1234sesame"))
        );
        assert_ne!(session_token(1234, "sesame"), session_token(1235, "sesame"));
        assert_ne!(session_token(1234, "sesame"), session_token(1234, "other"));
    }
}
