use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ReclaimerConfig;
use crate::sandbox::SandboxRunner;
use crate::workspace::{ActiveWorkspaces, WorkspaceManager};

/// What one sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub workspaces_removed: usize,
    pub containers_removed: usize,
    pub images_pruned: bool,
    pub errors: Vec<String>,
}

/// Wakes the reclaimer every `every` executions
#[derive(Debug, Clone)]
pub struct ReclaimTrigger {
    every: u64,
    notify: Arc<Notify>,
}

impl ReclaimTrigger {
    /// Called with the running execution count
    pub fn executed(&self, count: u64) {
        if self.every > 0 && count % self.every == 0 {
            log::debug!("{count} executions done, requesting a sweep");
            self.notify.notify_one();
        }
    }
}

/// Removes workspaces, containers and images left behind by crashed or dropped requests
///
/// Only resources older than the retention window and not owned by an active
/// workspace are touched, so sweeping never races an in-flight execution.
pub struct Reclaimer {
    root: PathBuf,
    active: ActiveWorkspaces,
    runner: Arc<dyn SandboxRunner>,
    config: ReclaimerConfig,
    notify: Arc<Notify>,
}

impl Reclaimer {
    pub fn new(
        workspaces: &WorkspaceManager,
        runner: Arc<dyn SandboxRunner>,
        config: ReclaimerConfig,
    ) -> Self {
        Self {
            root: workspaces.root().to_path_buf(),
            active: workspaces.active().clone(),
            runner,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) -> ReclaimTrigger {
        ReclaimTrigger {
            every: self.config.every_n_executions,
            notify: self.notify.clone(),
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let root = self.root.clone();
        let active = self.active.clone();
        let retention = self.config.workspace_retention();

        let mut report = SweepReport::default();
        match tokio::task::spawn_blocking(move || sweep_workspaces(&root, &active, retention))
            .await
        {
            Ok((removed, errors)) => {
                report.workspaces_removed = removed;
                report.errors.extend(errors);
            }
            Err(e) => report.errors.push(format!("workspace sweep task failed: {e}")),
        }

        let stale = self
            .runner
            .sweep_stale(&self.active.snapshot(), &self.config.sweep_policy())
            .await;
        report.containers_removed = stale.containers_removed;
        report.images_pruned = stale.images_pruned;
        report.errors.extend(stale.errors);

        if report.errors.is_empty() {
            log::info!(
                "Sweep removed {} workspace(s) and {} container(s)",
                report.workspaces_removed,
                report.containers_removed
            );
        } else {
            log::warn!(
                "Sweep removed {} workspace(s) and {} container(s) with {} error(s): {:?}",
                report.workspaces_removed,
                report.containers_removed,
                report.errors.len(),
                report.errors
            );
        }
        report
    }

    /// Sweeps on every interval tick and whenever the trigger fires, until `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "Reclaimer started, sweeping every {}s",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Reclaimer received shutdown signal, stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = self.notify.notified() => {
                    self.sweep().await;
                    ticker.reset();
                }
            }
        }

        Ok(())
    }
}

fn sweep_workspaces(
    root: &Path,
    active: &ActiveWorkspaces,
    retention: Duration,
) -> (usize, Vec<String>) {
    let mut removed = 0;
    let mut errors = Vec::new();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return (0, errors),
        Err(e) => {
            errors.push(format!("reading {}: {e}", root.display()));
            return (0, errors);
        }
    };

    let now = SystemTime::now();
    for entry in entries.flatten() {
        let Some(id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if active.contains(&id) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < retention {
            continue;
        }
        // The id may have been claimed since the listing started
        if active.contains(&id) {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                log::debug!("Removed stale workspace {id}");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => errors.push(format!("removing workspace {id}: {e}")),
        }
    }

    (removed, errors)
}
