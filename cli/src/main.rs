mod progress;

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use log::debug;
use serde_json::{Map, Value};

use huntlog_core::report::diff::{describe, CodeSnippet};
use huntlog_core::{
    modules, scan_org, utils, Catalog, CatalogConfig, CatalogError, ConsoleSink, KindDiff, OrgStatus,
    Platform, ResultKind, ScanRunner, Staleness, StatusFilter, TimestampId,
};

use crate::progress::ProgressSink;

#[derive(Parser, Debug)]
#[command(
    name = "huntlog",
    version,
    about = "Bug-bounty recon catalog: tracked orgs, scan snapshots and diffs",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Track a program:               huntlog track acme hackerone --url https://hackerone.com/acme
  Scan cloned repositories:      huntlog scan acme --repos ./repos/acme
  What needs rescanning:         huntlog status
  What changed since last time:  huntlog diff acme --summary
  Import existing output:        huntlog import acme --semgrep semgrep.json --trufflehog th.jsonl
  Archive a closed program:      huntlog set-status acme archived"
)]
struct Cli {
    /// Catalog directory
    #[arg(long, global = true, env = "HUNTLOG_CATALOG", default_value = "catalog")]
    catalog: PathBuf,

    /// -v for info, -vv for debug logging
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start tracking an org
    Track {
        org: String,
        platform: Platform,
        #[arg(long)]
        url: Option<String>,
    },
    /// Stop tracking an org
    Untrack {
        org: String,
        /// Also delete its metadata and every snapshot
        #[arg(long)]
        delete_all: bool,
        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Mark an org active or archived
    SetStatus { org: String, status: OrgStatus },
    /// Staleness dashboard
    Status {
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        stale_days: Option<u32>,
        #[arg(long, conflicts_with = "active")]
        archived: bool,
        #[arg(long)]
        active: bool,
        #[arg(long)]
        json: bool,
    },
    /// Changes between two snapshots (default: previous and latest)
    Diff {
        org: String,
        old: Option<TimestampId>,
        new: Option<TimestampId>,
        #[arg(long)]
        kind: Option<ResultKind>,
        /// Counts only
        #[arg(long)]
        summary: bool,
        /// Show the source lines of added semgrep findings
        #[arg(long)]
        code: bool,
        #[arg(long)]
        json: bool,
    },
    /// List an org's snapshots
    Snapshots {
        org: String,
        #[arg(long)]
        json: bool,
    },
    /// Show or edit an org's metadata
    Meta {
        org: String,
        /// KEY=VALUE; VALUE is parsed as JSON when it can be
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        #[arg(long = "unset", value_name = "KEY")]
        unset: Vec<String>,
    },
    /// Create a snapshot from existing scanner output files
    Import {
        org: String,
        #[arg(long)]
        semgrep: Option<PathBuf>,
        #[arg(long)]
        trufflehog: Option<PathBuf>,
        #[arg(long)]
        kics: Option<PathBuf>,
        #[arg(long)]
        artifacts: Option<PathBuf>,
        #[arg(long)]
        commits: Option<PathBuf>,
        /// Timestamp id of the imported snapshot (default: now)
        #[arg(long, value_name = "YYYY-MM-DD-HHMM")]
        at: Option<TimestampId>,
    },
    /// Run the scanners over cloned repositories and snapshot the results
    Scan {
        org: String,
        /// Directory whose subdirectories are the org's repositories
        #[arg(long)]
        repos: PathBuf,
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
        #[arg(long)]
        skip_semgrep: bool,
        #[arg(long)]
        skip_trufflehog: bool,
        #[arg(long)]
        skip_kics: bool,
        #[arg(long)]
        skip_artifacts: bool,
        #[arg(long)]
        skip_commits: bool,
    },
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        let code = match err.downcast_ref::<CatalogError>() {
            Some(catalog_err) => {
                eprintln!("{}", format!("[!] {}: {}", catalog_err.kind(), catalog_err).red());
                catalog_err.exit_code()
            }
            None => {
                eprintln!("{}", format!("[!] Error: {:#}", err).red());
                1
            }
        };
        process::exit(code);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CatalogConfig::load(&cli.catalog)?;
    let root = cli.catalog;
    debug!("catalog at {} with {:?}", root.display(), config);

    match cli.command {
        Command::Track { org, platform, url } => {
            let catalog = Catalog::open(&root, config);
            let tracked = catalog.track(&org, platform, url.as_deref())?;
            println!("{}", format!("[+] Tracking {} on {}", tracked.name, tracked.platform).green());
            if tracked.scan_count > 0 {
                println!("    adopted {} existing snapshot(s)", tracked.scan_count);
            }
        }
        Command::Untrack { org, delete_all, yes } => {
            let catalog = Catalog::open(&root, config);
            if delete_all && !yes && !confirm(&format!("Delete all metadata and snapshots of '{}'?", org))? {
                bail!("untrack '{}' aborted", org);
            }
            catalog.untrack(&org, delete_all)?;
            let detail = if delete_all { " and deleted its data" } else { "" };
            println!("{}", format!("[+] Untracked {}{}", org, detail).green());
        }
        Command::SetStatus { org, status } => {
            let catalog = Catalog::open(&root, config);
            let updated = catalog.set_status(&org, status)?;
            match updated.archived_date {
                Some(date) => println!("[+] {} is archived (since {})", updated.name, date),
                None => println!("[+] {} is {}", updated.name, updated.status),
            }
        }
        Command::Status {
            org,
            stale_days,
            archived,
            active,
            json,
        } => {
            let stale_days = stale_days.unwrap_or(config.stale_days);
            let catalog = Catalog::open(&root, config);
            let filter = match (archived, active) {
                (true, _) => Some(StatusFilter::Archived),
                (_, true) => Some(StatusFilter::Active),
                _ => None,
            };
            let mut rows = catalog.dashboard(filter, stale_days)?;
            if let Some(name) = org {
                catalog.index().require("status", &name)?;
                rows.retain(|r| r.org == name);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No tracked orgs.");
            } else {
                println!(
                    "{:<24} {:<10} {:<16} {:>5}  {}",
                    "ORG".bold(),
                    "PLATFORM".bold(),
                    "LAST SCAN".bold(),
                    "SCANS".bold(),
                    "STATE".bold()
                );
                for row in &rows {
                    let last = row.last_scan.map(|ts| ts.to_string()).unwrap_or_else(|| "-".into());
                    println!(
                        "{:<24} {:<10} {:<16} {:>5}  {}",
                        row.org,
                        row.platform.as_str(),
                        last,
                        row.scan_count,
                        paint_staleness(row.staleness, row.age_days)
                    );
                }
            }
        }
        Command::Diff {
            org,
            old,
            new,
            kind,
            summary,
            code,
            json,
        } => {
            let catalog = Catalog::open(&root, config);
            let (old, new) = catalog.resolve_pair(&org, old, new)?;
            let diffs = match kind {
                Some(kind) => vec![catalog.diff(&org, old, new, kind)?],
                None => catalog.diff_all(&org, old, new)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&diffs)?);
            } else {
                println!("{}", format!("[*] {}: {} -> {}", org, old, new).bright_cyan().bold());
                for diff in &diffs {
                    print_diff(diff, summary, code);
                }
            }
        }
        Command::Snapshots { org, json } => {
            let catalog = Catalog::open(&root, config);
            catalog.index().require("snapshots", &org)?;
            let ids = catalog.snapshots().list_snapshots(&org)?;
            if json {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                println!("{}", serde_json::to_string_pretty(&ids)?);
            } else if ids.is_empty() {
                println!("No snapshots for {}.", org);
            } else {
                for id in ids {
                    let kinds = catalog.snapshots().result_kinds(&org, id)?;
                    let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                    println!("{}  {}", id, kinds.join(", ").dimmed());
                }
            }
        }
        Command::Meta { org, set, unset } => {
            let catalog = Catalog::open(&root, config);
            let meta = if set.is_empty() && unset.is_empty() {
                catalog.read_meta(&org)?
            } else {
                let patch = build_patch(&set, &unset)?;
                Some(catalog.write_meta(&org, &patch)?)
            };
            match meta {
                Some(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
                None => println!("{{}}"),
            }
        }
        Command::Import {
            org,
            semgrep,
            trufflehog,
            kics,
            artifacts,
            commits,
            at,
        } => {
            let inputs: Vec<(ResultKind, PathBuf)> = [
                (ResultKind::Semgrep, semgrep),
                (ResultKind::Trufflehog, trufflehog),
                (ResultKind::Kics, kics),
                (ResultKind::Artifacts, artifacts),
                (ResultKind::Commits, commits),
            ]
            .into_iter()
            .filter_map(|(kind, path)| path.map(|p| (kind, p)))
            .collect();
            if inputs.is_empty() {
                bail!("nothing to import: pass at least one of --semgrep, --trufflehog, --kics, --artifacts, --commits");
            }
            let catalog = Catalog::open(&root, config);
            let tracked = import(&catalog, &org, at, &inputs)?;
            println!(
                "{}",
                format!(
                    "[+] Imported snapshot {} for {} (scan #{})",
                    tracked.last_scan.map(|t| t.to_string()).unwrap_or_default(),
                    org,
                    tracked.scan_count
                )
                .green()
            );
        }
        Command::Scan {
            org,
            repos,
            jobs,
            skip_semgrep,
            skip_trufflehog,
            skip_kics,
            skip_artifacts,
            skip_commits,
        } => {
            let repo_dirs = utils::list_repos(&repos)
                .with_context(|| format!("reading repositories under {}", repos.display()))?;
            if repo_dirs.is_empty() {
                bail!("no repositories under {}", repos.display());
            }
            let skipped: Vec<ResultKind> = [
                (skip_semgrep, ResultKind::Semgrep),
                (skip_trufflehog, ResultKind::Trufflehog),
                (skip_kics, ResultKind::Kics),
                (skip_artifacts, ResultKind::Artifacts),
                (skip_commits, ResultKind::Commits),
            ]
            .into_iter()
            .filter_map(|(skip, kind)| skip.then_some(kind))
            .collect();

            let jobs = jobs.unwrap_or(config.jobs);
            let tools = modules::default_tools(&config);
            let catalog = Catalog::open(&root, config);
            // indicatif draws nothing off a terminal, so piped runs log line by line
            let (bar, sink) = if io::stderr().is_terminal() {
                let (bar, sink) = ProgressSink::new_ref();
                (Some(bar), sink)
            } else {
                (None, ConsoleSink::new_ref())
            };
            sink.on_log(
                "phase",
                &format!("[*] Scanning {} repositories of {} ({} jobs)", repo_dirs.len(), org, jobs),
            );
            let runner = ScanRunner::new(tools, jobs, sink).without(&skipped);
            let result = scan_org(&catalog, &org, &runner, &repo_dirs).await;
            if let Some(bar) = bar {
                bar.finish();
            }
            let tracked = result?;
            println!(
                "{}",
                format!(
                    "[+] Scan {} recorded for {} (scan #{})",
                    tracked.last_scan.map(|t| t.to_string()).unwrap_or_default(),
                    org,
                    tracked.scan_count
                )
                .green()
            );
        }
    }
    Ok(())
}

fn import<B: huntlog_core::IndexBackend>(
    catalog: &Catalog<B>,
    org: &str,
    at: Option<TimestampId>,
    inputs: &[(ResultKind, PathBuf)],
) -> anyhow::Result<huntlog_core::TrackedOrg> {
    let mut contents = Vec::with_capacity(inputs.len());
    for (kind, path) in inputs {
        let bytes = std::fs::read(path).with_context(|| format!("reading {} output {}", kind, path.display()))?;
        contents.push((*kind, bytes));
    }

    let mut handle = match at {
        Some(timestamp) => catalog.begin_scan_at(org, timestamp)?,
        None => catalog.begin_scan(org)?,
    };
    for (kind, bytes) in &contents {
        if let Err(e) = catalog.write_result_set(&mut handle, *kind, bytes) {
            catalog.abort_scan(handle)?;
            return Err(e.into());
        }
    }
    Ok(catalog.finish_scan(handle)?)
}

fn build_patch(set: &[String], unset: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut patch = Map::new();
    for pair in set {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("--set expects KEY=VALUE, got '{}'", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("--set expects KEY=VALUE, got '{}'", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        patch.insert(key.to_string(), value);
    }
    for key in unset {
        patch.insert(key.clone(), Value::Null);
    }
    Ok(patch)
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    eprint!("{} [y/N] ", question.yellow());
    io::stderr().flush().ok();
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn paint_staleness(staleness: Staleness, age_days: Option<i64>) -> String {
    let age = age_days.map(|d| format!(" ({}d)", d)).unwrap_or_default();
    match staleness {
        Staleness::Stale => format!("stale{}", age).red().bold().to_string(),
        Staleness::Never => "never scanned".yellow().to_string(),
        Staleness::Current => format!("current{}", age).green().to_string(),
        Staleness::Archived => "archived".dimmed().to_string(),
    }
}

fn print_diff(diff: &KindDiff, summary: bool, code: bool) {
    let header = format!(
        "{:<11} +{} -{} ={}",
        diff.kind.as_str(),
        diff.added.len(),
        diff.removed.len(),
        diff.unchanged_count
    );
    if diff.is_empty() {
        println!("{}", header.dimmed());
    } else {
        println!("{}", header.bold());
    }
    if summary {
        return;
    }
    for entry in &diff.added {
        println!("  {} {}", "+".green().bold(), describe(diff.kind, entry));
        if code && diff.kind == ResultKind::Semgrep {
            if let Some(snippet) = CodeSnippet::from_semgrep(entry) {
                for line in snippet.lines.lines() {
                    println!("      {}", line.dimmed());
                }
            }
        }
    }
    for entry in &diff.removed {
        println!("  {} {}", "-".red().bold(), describe(diff.kind, entry));
    }
}
