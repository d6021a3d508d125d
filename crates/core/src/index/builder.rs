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

//! Turns a batch of fetched pages into one in-memory shard fragment.
//! Every page contributes its own terms plus one pseudo-document per
//! outbound link, so anchor text becomes searchable against the page
//! it points to.

use anyhow::Result;
use chrono::Datelike;
use url::Url;

use crate::config::UrlClassTag;
use crate::fetcher::SiteRecord;
use crate::index::shard::ShardFragment;
use crate::index::DocKey;
use crate::phrases::parser::{extract_phrases, index_aware_phrases, unsafe_score};
use crate::phrases::tokenize;

/// Documents whose unsafe-term density reaches this are tagged
/// `safe:false`.
const SAFE_THRESHOLD: f64 = 0.02;

struct ClassTag {
    pattern: regex::Regex,
    tag: String,
}

pub struct IndexBuilder {
    class_tags: Vec<ClassTag>,
}

impl IndexBuilder {
    pub fn new(url_class_tags: &[UrlClassTag]) -> Result<Self> {
        let class_tags = url_class_tags
            .iter()
            .map(|t| {
                Ok(ClassTag {
                    pattern: regex::Regex::new(&t.pattern)?,
                    tag: format!("class:{}", t.class),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { class_tags })
    }

    /// Builds the shard fragment for one flushed batch. Records are
    /// consumed; nothing of the batch survives past the returned
    /// fragment.
    pub fn build(&self, records: Vec<SiteRecord>) -> ShardFragment {
        let mut fragment = ShardFragment::new();

        for record in records {
            self.add_record(&mut fragment, &record);
        }

        fragment
    }

    fn add_record(&self, fragment: &mut ShardFragment, record: &SiteRecord) {
        let key = DocKey::new(record.url.as_str(), &record.body, record.host());
        let offset = fragment.add_summary(&record.title, &record.description);
        let meta_tags = self.meta_tags(record);

        let (words, doc_len) = if record.is_meta_only {
            (Default::default(), 0)
        } else {
            let text = format!("{} {}", record.title, record.description);
            (
                index_aware_phrases(&text, &record.lang, fragment),
                tokenize(&text, &record.lang).len(),
            )
        };

        let mut meta_tags = meta_tags;
        meta_tags.push(if unsafe_score(&words, doc_len) >= SAFE_THRESHOLD {
            "safe:false".to_string()
        } else {
            "safe:true".to_string()
        });

        fragment.add_document_words(
            key,
            record.doc_rank,
            &words,
            &meta_tags,
            offset,
            doc_len,
            false,
        );

        for (link_url, anchor) in &record.links {
            self.add_link(fragment, record, link_url, anchor);
        }
    }

    /// One pseudo-document per outbound link, keyed so its inlink
    /// segment resolves to the linked page.
    fn add_link(&self, fragment: &mut ShardFragment, record: &SiteRecord, link_url: &str, anchor: &str) {
        let Ok(target) = Url::parse(link_url) else {
            return;
        };
        let target_host = target.host_str().unwrap_or_default();

        let link_id = format!("{}|{}", record.url, link_url);
        let key = DocKey::for_link(&link_id, anchor, target_host);

        let scope = if target_host == record.host() {
            "link:internal"
        } else {
            "link:external"
        };
        let tags = vec![scope.to_string(), format!("site:{target_host}")];

        let offset = fragment.add_summary(anchor, link_url);
        let words = extract_phrases(anchor, &record.lang);
        let doc_len = tokenize(anchor, &record.lang).len();

        fragment.add_document_words(key, record.doc_rank, &words, &tags, offset, doc_len, true);
    }

    fn meta_tags(&self, record: &SiteRecord) -> Vec<String> {
        let mut tags = Vec::new();

        // site: for the host and every parent domain suffix
        let host = record.host();
        if !host.is_empty() {
            let labels: Vec<&str> = host.split('.').collect();
            for start in 0..labels.len().saturating_sub(1) {
                tags.push(format!("site:{}", labels[start..].join(".")));
            }
            if labels.len() == 1 {
                tags.push(format!("site:{host}"));
            }
        }

        if let Some(filetype) = path_extension(&record.url) {
            tags.push(format!("filetype:{filetype}"));
        }

        if let Some(server) = &record.server {
            tags.push(format!("server:{}", server.to_ascii_lowercase()));
        }

        let date = record.fetched_at;
        tags.push(format!("date:{}", date.year()));
        tags.push(format!("date:{}-{:02}", date.year(), date.month()));

        tags.push(format!("lang:{}", record.lang));

        let url = record.url.as_str();
        for class in &self.class_tags {
            if class.pattern.is_match(url) {
                tags.push(class.tag.clone());
            }
        }

        tags
    }
}

fn path_extension(url: &Url) -> Option<String> {
    let path = url.path();
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;

    if ext.is_empty() || ext.len() > 6 {
        return None;
    }

    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::ToCrawlEntry;
    use crate::query::PostingSource;
    use chrono::TimeZone;

    fn record(url: &str, title: &str, description: &str) -> SiteRecord {
        let entry = ToCrawlEntry {
            url: url.to_string(),
            weight: 1.0,
            crawl_delay: 0,
        };
        let mut record = SiteRecord::new(Url::parse(url).unwrap(), &entry);
        record.title = title.to_string();
        record.description = description.to_string();
        record.body = format!("{title} {description}");
        record.fetched_at = chrono::Utc.with_ymd_and_hms(2013, 5, 17, 12, 0, 0).unwrap();
        record
    }

    fn builder() -> IndexBuilder {
        IndexBuilder::new(&[]).unwrap()
    }

    #[test]
    fn page_terms_indexed() {
        let fragment = builder().build(vec![record(
            "https://www.example.com/page.html",
            "Quick Brown Fox",
            "the quick brown fox jumps",
        )]);

        assert!(!fragment.postings("quick").is_empty());
        assert!(!fragment.postings("fox").is_empty());
        assert!(fragment.postings("missing").is_empty());
    }

    #[test]
    fn meta_tags_generated() {
        let fragment = builder().build(vec![record(
            "https://www.example.com/docs/page.html",
            "Title",
            "description",
        )]);

        for tag in [
            "site:www.example.com",
            "site:example.com",
            "filetype:html",
            "date:2013",
            "date:2013-05",
            "lang:en",
            "safe:true",
        ] {
            assert!(!fragment.postings(tag).is_empty(), "missing {tag}");
        }
    }

    #[test]
    fn url_class_tags_applied() {
        let builder = IndexBuilder::new(&[UrlClassTag {
            pattern: "/news/".to_string(),
            class: "news".to_string(),
        }])
        .unwrap();

        let tagged = builder.build(vec![record(
            "https://example.com/news/today.html",
            "News",
            "today",
        )]);
        let untagged = builder.build(vec![record(
            "https://example.com/about.html",
            "About",
            "us",
        )]);

        assert!(!tagged.postings("class:news").is_empty());
        assert!(untagged.postings("class:news").is_empty());
    }

    #[test]
    fn meta_only_records_skip_words() {
        let mut meta_only = record("https://example.com/sitemap.xml", "Sitemap", "urls here");
        meta_only.is_meta_only = true;

        let fragment = builder().build(vec![meta_only]);

        assert!(fragment.postings("sitemap").is_empty());
        assert!(fragment.postings("url").is_empty());
        assert!(!fragment.postings("site:example.com").is_empty());
    }

    #[test]
    fn link_pseudo_documents_indexed() {
        let mut page = record("https://example.com/a.html", "Page A", "text");
        page.links.insert(
            "https://example.com/b.html".to_string(),
            "internal anchor".to_string(),
        );
        page.links.insert(
            "https://other.org/c.html".to_string(),
            "external anchor".to_string(),
        );

        let fragment = builder().build(vec![page]);

        let anchors = fragment.postings("anchor");
        assert_eq!(anchors.len(), 2);
        assert!(anchors.iter().all(|p| p.is_link));

        assert_eq!(fragment.postings("link:internal").len(), 1);
        assert_eq!(fragment.postings("link:external").len(), 1);
    }

    #[test]
    fn anchor_pseudo_doc_resolves_to_linked_page() {
        let mut page = record("https://example.com/a.html", "Page A", "text");
        page.links.insert(
            "https://target.com/b.html".to_string(),
            "great resource".to_string(),
        );
        let target = record("https://target.com/b.html", "Target", "the target page");

        let fragment = std::sync::Arc::new(builder().build(vec![page, target]));
        let link_posting = fragment.postings("resourc")[0].clone();
        assert!(link_posting.is_link);

        let mut cursor =
            crate::index::shard::FragmentPostings::new(fragment.clone(), "resourc");
        let resolved = cursor
            .resolve_inlink(&link_posting.doc.inlink_segment())
            .unwrap();

        assert!(!resolved.is_link);
    }

    #[test]
    fn unsafe_documents_tagged() {
        let fragment = builder().build(vec![record(
            "https://example.com/x.html",
            "porn porn porn",
            "porn porn",
        )]);

        assert!(!fragment.postings("safe:false").is_empty());
        assert!(fragment.postings("safe:true").is_empty());
    }
}
