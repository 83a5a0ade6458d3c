//! dreview: distributed code review metadata for git repositories.
//!
//! Review annotations live in git notes channels next to the code and are
//! replicated between clones with a conflict-free union merge.
//!
//! # Usage
//!
//! ```bash
//! # Record an annotation on a commit
//! dreview append HEAD "lgtm:alice" --channel reviews
//!
//! # Show annotations on a commit
//! dreview show HEAD
//!
//! # Exchange annotations with a remote
//! dreview pull origin
//! dreview push origin
//!
//! # Commits to review between two points, even after a rebase
//! dreview range old-tip HEAD
//!
//! # Cheap change detection
//! dreview state-hash
//! ```

mod lock;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dreview_core::{
    AnnotationLog, GitStore, HistoryResolver, HistoryStore, MergeOutcome, Replicator,
    ReviewConfig, channels, state_fingerprint,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::lock::RepoLock;

#[derive(Parser, Debug)]
#[command(name = "dreview")]
#[command(author = "DReview Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Distributed code review metadata for git")]
struct Cli {
    /// Repository path
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append a record to a commit's annotations
    Append {
        /// Commit id or ref
        commit: String,
        /// Record text (single line)
        record: String,
        /// Channel name or full notes ref
        #[arg(short, long, default_value = "reviews")]
        channel: String,
    },

    /// Show a commit's annotations
    Show {
        /// Commit id or ref
        commit: String,
        /// Channel name or full notes ref
        #[arg(short, long, default_value = "reviews")]
        channel: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// List annotated commits
    List {
        /// Channel name or full notes ref (default: all configured channels)
        #[arg(short, long)]
        channel: Option<String>,
    },

    /// Push annotation channels to a remote
    Push {
        /// Remote name (default from config)
        remote: Option<String>,
    },

    /// Fetch and merge annotation channels from a remote
    Pull {
        /// Remote name (default from config)
        remote: Option<String>,
    },

    /// List commits between two revisions, oldest first
    Range {
        /// Start (exclusive)
        from: String,
        /// End (inclusive)
        to: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a fingerprint of all refs
    #[command(name = "state-hash")]
    StateHash,

    /// Show the current HEAD
    Head,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dreview=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let repo = cli.repo.as_path();

    match cli.command {
        Commands::Append {
            commit,
            record,
            channel,
        } => cmd_append(repo, &channel, &commit, &record),

        Commands::Show {
            commit,
            channel,
            json,
        } => cmd_show(repo, &channel, &commit, json),

        Commands::List { channel } => cmd_list(repo, channel.as_deref()),

        Commands::Push { remote } => cmd_push(repo, remote),

        Commands::Pull { remote } => cmd_pull(repo, remote),

        Commands::Range { from, to, json } => cmd_range(repo, &from, &to, json),

        Commands::StateHash => cmd_state_hash(repo),

        Commands::Head => cmd_head(repo),
    }
}

/// Expand a short channel name (`reviews`) to its notes ref.
fn channel_ref(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("{}{}", channels::ALL.trim_end_matches('*'), name)
    }
}

fn open_store(repo: &Path) -> Result<Arc<GitStore>> {
    let store = GitStore::discover(repo)
        .with_context(|| format!("Failed to open git repository at {:?}", repo))?;
    Ok(Arc::new(store))
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

fn cmd_append(repo: &Path, channel: &str, commit: &str, record: &str) -> Result<()> {
    let store = open_store(repo)?;
    let _lock = RepoLock::acquire(store.git_dir())?;

    let channel = channel_ref(channel);
    let id = store
        .resolve_ref(commit)
        .with_context(|| format!("Unknown commit: {}", commit))?;
    AnnotationLog::new(store.clone())
        .append(&channel, id, record.as_bytes())
        .with_context(|| format!("Failed to append to {}", channel))?;

    println!("Appended to {} on {}", channel, id.short());
    Ok(())
}

#[derive(Serialize)]
struct ShowOutput {
    commit: String,
    channel: String,
    records: Vec<String>,
}

fn cmd_show(repo: &Path, channel: &str, commit: &str, json: bool) -> Result<()> {
    let store = open_store(repo)?;
    let channel = channel_ref(channel);
    let id = store
        .resolve_ref(commit)
        .with_context(|| format!("Unknown commit: {}", commit))?;
    let records = AnnotationLog::new(store.clone()).read(&channel, id)?;
    let records: Vec<String> = records
        .iter()
        .map(|r| String::from_utf8_lossy(r).into_owned())
        .collect();

    if json {
        let output = ShowOutput {
            commit: id.to_hex(),
            channel,
            records,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Commit:  {}", id);
    println!("Channel: {}", channel);
    if records.is_empty() {
        println!("\nNo annotations.");
    }
    for record in records {
        println!("  {}", record);
    }
    Ok(())
}

fn cmd_list(repo: &Path, channel: Option<&str>) -> Result<()> {
    let store = open_store(repo)?;
    let names = match channel {
        Some(channel) => vec![channel_ref(channel)],
        None => ReviewConfig::load(store.git_dir())?.channels,
    };

    let log = AnnotationLog::new(store.clone());
    for channel in names {
        let commits = log.list_annotated_commits(&channel)?;
        println!("{} ({} commits)", channel, commits.len());
        for commit in commits {
            println!("  {}", commit);
        }
    }
    Ok(())
}

fn cmd_push(repo: &Path, remote: Option<String>) -> Result<()> {
    let store = open_store(repo)?;
    let config = ReviewConfig::load(store.git_dir())?;
    let remote = remote.unwrap_or(config.remote);
    let _lock = RepoLock::acquire(store.git_dir())?;

    println!("Pushing {} to {}...", config.channel_pattern, remote);
    let report = Replicator::new(store.clone())
        .push(&remote, &config.channel_pattern)
        .context("Push failed; pull first if the remote has new annotations")?;

    if report.refs.is_empty() {
        println!("Nothing to push.");
    }
    for channel in &report.refs {
        println!("  {}", channel);
    }
    Ok(())
}

fn cmd_pull(repo: &Path, remote: Option<String>) -> Result<()> {
    let store = open_store(repo)?;
    let config = ReviewConfig::load(store.git_dir())?;
    let remote = remote.unwrap_or(config.remote);
    let _lock = RepoLock::acquire(store.git_dir())?;

    println!("Pulling {} from {}...", config.channel_pattern, remote);
    let report = Replicator::new(store.clone()).pull(&remote, &config.channel_pattern)?;

    if report.merged.is_empty() && report.failed.is_empty() {
        println!("No channels on remote.");
    }
    for (channel, outcome) in &report.merged {
        match outcome {
            MergeOutcome::UpToDate => println!("  {}: up to date", channel),
            MergeOutcome::FastForward(id) => {
                println!("  {}: fast-forward to {}", channel, id.short())
            }
            MergeOutcome::Merged { version, annotated } => println!(
                "  {}: merged as {} ({} commits annotated)",
                channel,
                version.short(),
                annotated
            ),
        }
    }
    for failure in &report.failed {
        eprintln!("  {}", failure);
    }

    if !report.is_success() {
        return Err(anyhow!(
            "{} channel(s) failed to merge",
            report.failed.len()
        ));
    }
    Ok(())
}

#[derive(Serialize)]
struct RangeEntry {
    id: String,
    summary: String,
}

fn cmd_range(repo: &Path, from: &str, to: &str, json: bool) -> Result<()> {
    let store = open_store(repo)?;
    let commits = HistoryResolver::new(store.clone())
        .list_commits_between_refs(from, to)
        .with_context(|| format!("Failed to list commits {}..{}", from, to))?;

    let mut entries = Vec::with_capacity(commits.len());
    for id in commits {
        let message = store.commit_message(id)?;
        entries.push(RangeEntry {
            id: id.to_hex(),
            summary: first_line(&message).to_string(),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!("{} {}", &entry.id[..8], entry.summary);
    }
    Ok(())
}

fn cmd_state_hash(repo: &Path) -> Result<()> {
    let store = open_store(repo)?;
    println!("{}", state_fingerprint(store.as_ref())?);
    Ok(())
}

fn cmd_head(repo: &Path) -> Result<()> {
    let store = open_store(repo)?;
    let id = store.resolve_ref("HEAD").context("HEAD does not point at a commit")?;
    match store.head_ref()? {
        Some(name) => println!("Ref:     {}", name),
        None => println!("Ref:     (detached)"),
    }
    println!("Commit:  {}", id);
    println!("Subject: {}", first_line(&store.commit_message(id)?));
    Ok(())
}
