//! git-mirror-cache: inspect and refresh a local mirror of a Git repository
//!
//! ```bash
//! # Pull commits, trees and tags from a repository into the cache
//! git-mirror-cache sync /path/to/repo
//!
//! # Look at what was mirrored
//! git-mirror-cache refs
//! git-mirror-cache show main
//! git-mirror-cache cat-file HEAD
//! ```

mod config;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use git_mirror_cache::{
    format_tz, kind_name, CancelToken, GitRemote, ObjectCache, ObjectId, Signature,
};
use serde_json::json;

use config::CacheConfig;

#[derive(Parser, Debug)]
#[command(name = "git-mirror-cache")]
#[command(version)]
#[command(about = "Local SQLite mirror of a Git repository's commits, trees and tags")]
struct Cli {
    /// Cache database (overrides config and GIT_MIRROR_CACHE_PATH)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Config file (default ~/.config/git-mirror-cache/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch everything reachable from the repository's refs into the cache
    Sync {
        /// Path to the repository to mirror
        repo: PathBuf,
        /// Partial-clone filter to request (e.g. blob:none)
        #[arg(long, conflicts_with = "no_filter")]
        filter: Option<String>,
        /// Fetch unfiltered, even if the config names a filter
        #[arg(long)]
        no_filter: bool,
        /// Comma-separated refs or ref prefixes to mirror
        #[arg(long, value_delimiter = ',')]
        refs: Vec<String>,
        /// Print the sync report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print an object's type and size
    Stat { rev: String },
    /// Write an object's verified content to stdout
    CatFile { rev: String },
    /// Show indexed commit metadata
    Show {
        rev: String,
        #[arg(long)]
        json: bool,
    },
    /// List refs recorded by the last sync
    Refs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = CacheConfig::load(cli.config.as_deref())?;
    if let Some(cache) = cli.cache {
        config.cache_path = cache;
    }
    let cache_path = config.ensure_cache_path()?;
    let mut cache = ObjectCache::open(&cache_path)
        .with_context(|| format!("Failed to open cache {:?}", cache_path))?;

    match cli.command {
        Commands::Sync {
            repo,
            filter,
            no_filter,
            refs,
            json,
        } => {
            let mut options = config.sync_options();
            if no_filter {
                options.filter = None;
            } else if filter.is_some() {
                options.filter = filter;
            }
            if !refs.is_empty() {
                options.ref_prefixes = refs;
            }
            cmd_sync(&mut cache, repo, &options, json)?
        }
        Commands::Stat { rev } => cmd_stat(&cache, &rev)?,
        Commands::CatFile { rev } => cmd_cat_file(&cache, &rev)?,
        Commands::Show { rev, json } => cmd_show(&cache, &rev, json)?,
        Commands::Refs => cmd_refs(&cache)?,
    }

    cache.close().context("Failed to close cache")?;
    Ok(())
}

fn cmd_sync(
    cache: &mut ObjectCache,
    repo: PathBuf,
    options: &git_mirror_cache::SyncOptions,
    json: bool,
) -> Result<()> {
    let mut remote = GitRemote::new(repo);
    let report = cache
        .sync(&mut remote, options, &CancelToken::new())
        .with_context(|| format!("Failed to sync from {:?}", remote.repo()))?;

    if json {
        let failures: Vec<_> = report
            .index_failures
            .iter()
            .map(|f| json!({ "id": f.id.to_hex(), "reason": f.reason }))
            .collect();
        let out = json!({
            "refs": report.refs,
            "refs_changed": report.refs_changed,
            "refs_removed": report.refs_removed,
            "wanted": report.wanted,
            "pack_entries": report.pack_entries,
            "objects_inserted": report.objects_inserted,
            "deltas_resolved": report.deltas_resolved,
            "skipped": report.skipped,
            "commits_indexed": report.commits_indexed,
            "tags_indexed": report.tags_indexed,
            "index_failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "{} refs, {} pack entries: {} objects stored ({} from deltas), {} skipped",
            report.refs,
            report.pack_entries,
            report.objects_inserted,
            report.deltas_resolved,
            report.skipped
        );
        println!(
            "indexed {} commits and {} tags",
            report.commits_indexed, report.tags_indexed
        );
        for failure in &report.index_failures {
            eprintln!("warning: {} not indexed: {}", failure.id, failure.reason);
        }
    }
    Ok(())
}

fn resolve(cache: &ObjectCache, rev: &str) -> Result<ObjectId> {
    cache
        .resolve(rev)
        .with_context(|| format!("Cannot resolve {rev:?}"))
}

fn cmd_stat(cache: &ObjectCache, rev: &str) -> Result<()> {
    let id = resolve(cache, rev)?;
    let info = cache.stat(&id)?;
    println!("{} {} {}", id, kind_name(info.kind), info.size);
    Ok(())
}

fn cmd_cat_file(cache: &ObjectCache, rev: &str) -> Result<()> {
    let id = resolve(cache, rev)?;
    let mut reader = cache.open_object(&id)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut reader, &mut out).with_context(|| format!("Failed to read object {id}"))?;
    out.flush()?;
    reader.close()?;
    Ok(())
}

fn timestamp(sig: &Signature) -> String {
    FixedOffset::east_opt(sig.tz_minutes * 60)
        .zip(DateTime::from_timestamp(sig.time, 0))
        .map(|(offset, utc)| {
            utc.with_timezone(&offset)
                .format("%a %b %e %H:%M:%S %Y %z")
                .to_string()
        })
        .unwrap_or_else(|| format!("{} {}", sig.time, format_tz(sig.tz_minutes)))
}

fn cmd_show(cache: &ObjectCache, rev: &str, json: bool) -> Result<()> {
    let id = cache.peel(&resolve(cache, rev)?)?;
    let commit = cache
        .commit(&id)
        .with_context(|| format!("{id} is not an indexed commit"))?;

    if json {
        let out = json!({
            "id": commit.id.to_hex(),
            "tree": commit.tree.to_hex(),
            "parents": commit.parents.iter().map(ObjectId::to_hex).collect::<Vec<_>>(),
            "author": {
                "ident": commit.author.ident,
                "time": commit.author.time,
                "tz": format_tz(commit.author.tz_minutes),
            },
            "committer": {
                "ident": commit.committer.ident,
                "time": commit.committer.time,
                "tz": format_tz(commit.committer.tz_minutes),
            },
            "message": commit.message,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("commit {}", commit.id);
    println!("tree {}", commit.tree);
    for parent in &commit.parents {
        println!("parent {parent}");
    }
    println!("Author: {}", commit.author.ident);
    println!("Date:   {}", timestamp(&commit.author));
    println!("Commit: {}", commit.committer.ident);
    println!("Date:   {}", timestamp(&commit.committer));
    println!();
    for line in commit.message.lines() {
        println!("    {line}");
    }
    Ok(())
}

fn cmd_refs(cache: &ObjectCache) -> Result<()> {
    for (name, id) in cache.refs()? {
        println!("{id} {name}");
    }
    Ok(())
}
