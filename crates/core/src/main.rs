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
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use trawler::config;
use trawler::fetcher::worker::Fetcher;
use trawler::index::shard::{FragmentPostings, ShardFragment};
use trawler::query::group::GroupIterator;
use trawler::query::phrase_filter::PhraseFilterIterator;
use trawler::query::{PostingSource, SummaryStore};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a fetcher: a long-running daemon that pulls crawl
    /// batches from the queue server, downloads pages and uploads
    /// mini index fragments.
    Fetcher { config_path: PathBuf },

    /// Query a serialized shard fragment. Mostly useful to inspect
    /// what a fetcher produced.
    SearchShard {
        shard_path: PathBuf,
        term: String,

        /// Phrases the summary must match; '*' matches any gap.
        #[clap(long)]
        restrict: Vec<String>,

        /// Substrings that exclude a document.
        #[clap(long)]
        disallow: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive("trawler=info".parse().unwrap())
                .from_env_lossy(),
        )
        .without_time()
        .with_target(false)
        .finish()
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Fetcher { config_path } => {
            let config = config::load_fetcher_config(&config_path)
                .with_context(|| format!("loading config from {}", config_path.display()))?;

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async {
                Fetcher::new(config)?.run().await;
                Ok::<(), anyhow::Error>(())
            })?;
        }
        Commands::SearchShard {
            shard_path,
            term,
            restrict,
            disallow,
        } => {
            let bytes = std::fs::read(&shard_path)
                .with_context(|| format!("reading shard from {}", shard_path.display()))?;
            let fragment = Arc::new(ShardFragment::deserialize(&bytes)?);

            let grouped = GroupIterator::new(FragmentPostings::new(fragment.clone(), &term));
            let mut results =
                PhraseFilterIterator::new(grouped, fragment.clone(), &restrict, &disallow, 1.0, 0)?;

            while let Some(block) = results.next_block() {
                for posting in block {
                    let summary = fragment.summary(posting.summary_offset).unwrap_or_default();
                    println!("{:.4}\t{}\t{}", posting.score, posting.doc, summary);
                }
            }
        }
    }

    Ok(())
}
