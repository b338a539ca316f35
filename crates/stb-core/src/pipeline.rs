//! Retrieval → packaging → delivery pipeline with per-item fault isolation.
//!
//! One run owns one credential scope and one remote session. Manifest items are
//! processed strictly one after another; an item can end up delivered, skipped
//! (remote file absent) or failed, and a failed item never stops the run. Only
//! a connection failure (or an unusable config) aborts the run early.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    credential::CredentialScope,
    discovery::discover,
    domain::{KeyReference, ManifestEntry, ManifestSource},
    errors::Error,
    packager::ArtifactPackager,
    ports::{DeliveryClient, RemoteConnector, RemoteSession},
    staging::{prepare_work_dir, StagedFile},
    Result,
};

/// Progress of a single manifest item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Checked,
    Fetched,
    Packaged,
    Delivered,
    Cleaned,
}

impl ItemState {
    /// The step attempted when leaving this state.
    pub fn next_step(self) -> &'static str {
        match self {
            ItemState::Pending => "stat",
            ItemState::Checked => "fetch",
            ItemState::Fetched => "package",
            ItemState::Packaged => "deliver",
            ItemState::Delivered => "cleanup",
            ItemState::Cleaned => "done",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::Checked => "checked",
            ItemState::Fetched => "fetched",
            ItemState::Packaged => "packaged",
            ItemState::Delivered => "delivered",
            ItemState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum ItemOutcome {
    Delivered {
        artifact: String,
        size: u64,
        sha256: String,
    },
    /// The remote file does not exist. Not an error.
    Skipped,
    Failed {
        /// Last state reached before the failing step.
        after: ItemState,
        error: Error,
    },
}

#[derive(Debug)]
pub struct ItemReport {
    pub entry: ManifestEntry,
    pub outcome: ItemOutcome,
}

#[derive(Debug)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items: Vec<ItemReport>,
    /// Set when cancellation stopped the run before every entry was attempted.
    pub interrupted: bool,
    pub not_attempted: usize,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            items: Vec::new(),
            interrupted: false,
            not_attempted: 0,
        }
    }

    pub fn delivered(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Delivered { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct Pipeline {
    cfg: Arc<Config>,
    connector: Arc<dyn RemoteConnector>,
    delivery: Arc<dyn DeliveryClient>,
    packager: ArtifactPackager,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<Config>,
        connector: Arc<dyn RemoteConnector>,
        delivery: Arc<dyn DeliveryClient>,
    ) -> Self {
        let packager = ArtifactPackager::new(cfg.compress_suffixes.clone(), cfg.archive_format);
        Self {
            cfg,
            connector,
            delivery,
            packager,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between items (and during the pacing wait) once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Execute one full run.
    ///
    /// Returns `Err` only for fatal failures; item failures are reported in the
    /// summary. The transient key is gone when this returns, whichever way.
    pub async fn run(&self) -> Result<RunSummary> {
        let scope = CredentialScope::acquire(&self.cfg.ssh_key, &self.cfg.ephemeral_key_path)?;
        let result = self.run_with_key(scope.reference()).await;
        if let Err(e) = scope.release() {
            warn!(error = %e, "failed to remove ephemeral ssh key");
        }

        if let Ok(summary) = &result {
            info!(
                delivered = summary.delivered(),
                skipped = summary.skipped(),
                failed = summary.failed(),
                not_attempted = summary.not_attempted,
                "run finished"
            );
        }
        result
    }

    async fn run_with_key(&self, key: &KeyReference) -> Result<RunSummary> {
        prepare_work_dir(&self.cfg.work_dir)?;

        let target = self.cfg.remote_target();
        info!(target = %target, "connecting");
        let session = self.connector.connect(&target, key).await?;

        let summary = self.process_all(session.as_ref()).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "failed to close remote session");
        }
        Ok(summary)
    }

    async fn process_all(&self, session: &dyn RemoteSession) -> RunSummary {
        let mut summary = RunSummary::new();

        let entries = match &self.cfg.manifest {
            ManifestSource::Static(entries) => entries.clone(),
            ManifestSource::Discover(rules) => discover(session, rules).await,
        };
        info!(count = entries.len(), "processing manifest");

        let total = entries.len();
        for (idx, entry) in entries.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                summary.not_attempted = total - idx;
                warn!(remaining = total - idx, "run cancelled, skipping remaining entries");
                break;
            }

            let outcome = self.process_entry(session, &entry).await;
            log_outcome(&entry, &outcome);

            let delivered = matches!(outcome, ItemOutcome::Delivered { .. });
            summary.items.push(ItemReport { entry, outcome });

            if delivered && idx + 1 < total {
                self.pace().await;
            }
        }

        summary.finished_at = Some(Utc::now());
        summary
    }

    /// Drive one entry to a terminal state. Never fails: errors become `Failed`.
    pub async fn process_entry(
        &self,
        session: &dyn RemoteSession,
        entry: &ManifestEntry,
    ) -> ItemOutcome {
        let mut state = ItemState::Pending;
        match self.drive(session, entry, &mut state).await {
            Ok(outcome) => outcome,
            Err(error) => ItemOutcome::Failed {
                after: state,
                error,
            },
        }
    }

    async fn drive(
        &self,
        session: &dyn RemoteSession,
        entry: &ManifestEntry,
        state: &mut ItemState,
    ) -> Result<ItemOutcome> {
        let remote = entry.remote_path.as_str();

        if !session.exists(remote).await? {
            return Ok(ItemOutcome::Skipped);
        }
        advance(state, ItemState::Checked, remote);

        // Every local file from here on is held by a guard; leaving this
        // function on any path removes it.
        let staged = StagedFile::claim(&self.cfg.work_dir, remote)?;
        let bytes = session.fetch(remote, staged.local_path()).await?;
        debug!(remote_path = %remote, bytes, "fetched");
        advance(state, ItemState::Fetched, remote);

        let packager = self.packager.clone();
        let artifact = tokio::task::spawn_blocking(move || packager.package(staged))
            .await
            .map_err(|e| Error::Packaging(format!("packaging task failed: {e}")))??;
        debug!(
            remote_path = %remote,
            archived = artifact.archived(),
            bytes = artifact.size(),
            "packaged"
        );
        advance(state, ItemState::Packaged, remote);

        let caption = self.cfg.caption_for(&entry.description);
        self.delivery
            .deliver(artifact.local_path(), &caption)
            .await?;
        advance(state, ItemState::Delivered, remote);

        let outcome = ItemOutcome::Delivered {
            artifact: artifact.file_name(),
            size: artifact.size(),
            sha256: artifact.sha256().to_string(),
        };
        let local = artifact.local_path().to_path_buf();
        if let Err(e) = artifact.discard() {
            // Delivered already: cleanup failure is only logged.
            warn!(path = %local.display(), error = %e, "failed to remove delivered artifact");
        }
        advance(state, ItemState::Cleaned, remote);

        Ok(outcome)
    }

    async fn pace(&self) {
        let interval: Duration = self.cfg.pacing_interval;
        if interval.is_zero() {
            return;
        }
        tokio::select! {
            _ = sleep(interval) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

fn advance(state: &mut ItemState, next: ItemState, remote: &str) {
    debug!(remote_path = %remote, from = %state, to = %next, "item state");
    *state = next;
}

fn log_outcome(entry: &ManifestEntry, outcome: &ItemOutcome) {
    match outcome {
        ItemOutcome::Delivered {
            artifact,
            size,
            sha256,
        } => info!(
            description = %entry.description,
            remote_path = %entry.remote_path,
            artifact = %artifact,
            bytes = size,
            sha256 = %sha256,
            "delivered"
        ),
        ItemOutcome::Skipped => info!(
            description = %entry.description,
            remote_path = %entry.remote_path,
            "remote file not found, skipping"
        ),
        ItemOutcome::Failed { after, error } => error!(
            description = %entry.description,
            remote_path = %entry.remote_path,
            stage = after.next_step(),
            error = %error,
            "item failed"
        ),
    }
}
