use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::future;
use log::{info, warn};
use tokio::sync::{mpsc, Semaphore};

use crate::catalog::index::IndexBackend;
use crate::catalog::Catalog;
use crate::core::aggregator::{self, RepoOutput, ResultAggregator};
use crate::model::TrackedOrg;
use crate::modules::{self, ToolRef};
use crate::normalize::ResultKind;
use crate::utils;
use crate::SinkRef;

/// What a run produced, before it is written to a snapshot.
#[derive(Debug, Default)]
pub struct RunOutput {
    /// Rendered content per kind, for every tool that ran.
    pub sets: BTreeMap<ResultKind, Vec<u8>>,
    /// Kinds whose binary was not found.
    pub skipped: Vec<ResultKind>,
    /// (tool, repository) invocations that failed.
    pub failures: usize,
}

/// Runs the scanners over a set of repositories, at most `jobs`
/// subprocesses at a time.
pub struct ScanRunner {
    tools: Vec<ToolRef>,
    jobs: usize,
    sink: SinkRef,
}

impl ScanRunner {
    pub fn new(tools: Vec<ToolRef>, jobs: usize, sink: SinkRef) -> Self {
        Self {
            tools,
            jobs: jobs.max(1),
            sink,
        }
    }

    /// Drops the tools producing any of `kinds`.
    pub fn without(mut self, kinds: &[ResultKind]) -> Self {
        self.tools.retain(|t| !kinds.contains(&t.kind()));
        self
    }

    pub fn kinds(&self) -> Vec<ResultKind> {
        self.tools.iter().map(|t| t.kind()).collect()
    }

    pub async fn run(&self, repos: &[PathBuf]) -> anyhow::Result<RunOutput> {
        let mut output = RunOutput::default();
        let mut available = Vec::new();
        for tool in &self.tools {
            match utils::get_binary_path(tool.binary()) {
                Some(path) => available.push((Arc::clone(tool), path)),
                None => {
                    warn!("{} not found, skipping {}", tool.binary(), tool.kind());
                    self.sink.on_log(
                        "warn",
                        &format!("[!] '{}' binary not found, skipping {}", tool.binary(), tool.kind()),
                    );
                    output.skipped.push(tool.kind());
                }
            }
        }

        let total = available.len() * repos.len();
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let (tx, rx) = mpsc::channel::<RepoOutput>(self.jobs * 2);
        let aggregator = tokio::spawn(ResultAggregator::run(rx, Arc::clone(&self.sink)));
        let done = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        self.sink.on_progress("scanning", 0, total);
        for repo in repos {
            for (tool, binary) in &available {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .context("scan worker pool closed")?;
                let tool = Arc::clone(tool);
                let binary = binary.clone();
                let repo = repo.clone();
                let tx = tx.clone();
                let sink = Arc::clone(&self.sink);
                let done = Arc::clone(&done);
                let failures = Arc::clone(&failures);

                tasks.push(tokio::spawn(async move {
                    let _permit = permit;
                    let repo_name = utils::repo_name(&repo);
                    match modules::run_tool(tool.as_ref(), &binary, &repo).await {
                        Ok(entries) => {
                            let _ = tx
                                .send(RepoOutput {
                                    kind: tool.kind(),
                                    repo: repo_name,
                                    entries,
                                })
                                .await;
                        }
                        Err(e) => {
                            failures.fetch_add(1, Ordering::SeqCst);
                            warn!("{} failed on {}: {:#}", tool.binary(), repo_name, e);
                            sink.on_log("error", &format!("[!] {} failed on {}: {:#}", tool.binary(), repo_name, e));
                        }
                    }
                    let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                    sink.on_progress("scanning", current, total);
                }));
            }
        }
        drop(tx);

        for joined in future::join_all(tasks).await {
            if let Err(e) = joined {
                warn!("scan task aborted: {}", e);
            }
        }
        let mut merged = aggregator.await.context("result aggregator panicked")?;

        // tools that ran but found nothing still produce an (empty) set
        let ran: BTreeSet<ResultKind> = available.iter().map(|(t, _)| t.kind()).collect();
        for kind in ran {
            let entries = merged.remove(&kind).unwrap_or_default();
            output.sets.insert(kind, aggregator::render(kind, entries));
        }
        output.failures = failures.load(Ordering::SeqCst);
        Ok(output)
    }
}

/// Writes a run's output as a new snapshot of `org` and records the scan.
/// The snapshot is begun before any tool runs, so a conflicting scan fails
/// fast.
pub async fn scan_org<B: IndexBackend>(
    catalog: &Catalog<B>,
    org: &str,
    runner: &ScanRunner,
    repos: &[PathBuf],
) -> anyhow::Result<TrackedOrg> {
    let mut handle = catalog.begin_scan(org)?;
    info!("scanning {} ({} repositories) as {}", org, repos.len(), handle.timestamp());

    let output = match runner.run(repos).await {
        Ok(output) => output,
        Err(e) => {
            catalog.abort_scan(handle)?;
            return Err(e);
        }
    };

    for (kind, content) in &output.sets {
        if let Err(e) = catalog.write_result_set(&mut handle, *kind, content) {
            catalog.abort_scan(handle)?;
            return Err(e.into());
        }
    }
    Ok(catalog.finish_scan(handle)?)
}
