use crate::client::pending::{PendingStore, PendingWrite};
use crate::client::transport::SettingsTransport;
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::realtime::RealtimeEvent;
use crate::server::WriteOutcome;
use crate::types::{
    ClientId, Document, LogicalClock, Patch, Scope, Snapshot, VersionStamp, now_millis,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Offline,
    Conflict,
    Error,
}

/// Both sides of the last lost write
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub local: Document,
    pub server: Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Clean,
    Accepted(VersionStamp),
    /// The server kept its version; the agent adopted it
    Conflict,
    /// Offline or a transient failure; the edit stays pending
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    Edit(Document),
    RemotePatch { patch: Patch, stamp: VersionStamp },
    VersionBumped(VersionStamp),
    Online(bool),
    SyncNow,
    Shutdown,
}

impl From<RealtimeEvent> for AgentCommand {
    fn from(event: RealtimeEvent) -> Self {
        match event {
            RealtimeEvent::Patch { patch, stamp } => AgentCommand::RemotePatch { patch, stamp },
            RealtimeEvent::VersionBumped(stamp) => AgentCommand::VersionBumped(stamp),
        }
    }
}

enum Wake {
    Command(Option<AgentCommand>),
    Debounce,
}

/// Keeps one peer's copy of a scope's document in step with the server
///
/// Local edits apply immediately and land in a single durable pending slot;
/// the slot is pushed as a whole-document replace once edits go quiet. The
/// server always wins a conflict.
pub struct SyncAgent<T: SettingsTransport, P: PendingStore> {
    scope: Scope,
    client_id: ClientId,
    transport: T,
    pending: P,
    document: Document,
    stamp: Option<VersionStamp>,
    dirty: Option<PendingWrite>,
    online: bool,
    debounce: Duration,
    request_timeout: Duration,
    status: watch::Sender<SyncStatus>,
    last_conflict: Option<ConflictInfo>,
}

impl<T: SettingsTransport, P: PendingStore> SyncAgent<T, P> {
    pub fn new(scope: Scope, transport: T, pending: P, config: &ClientConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            scope,
            client_id: ClientId::generate(),
            transport,
            pending,
            document: Document::new(),
            stamp: None,
            dirty: None,
            online: true,
            debounce: config.debounce(),
            request_timeout: config.request_timeout(),
            status,
            last_conflict: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Last server version this agent has seen
    pub fn stamp(&self) -> Option<VersionStamp> {
        self.stamp
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn last_conflict(&self) -> Option<&ConflictInfo> {
        self.last_conflict.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Clock for a patch originating here
    pub fn clock(&self) -> LogicalClock {
        LogicalClock::now(&self.client_id)
    }

    /// Restore any edit left from a previous run and push it, otherwise pull
    pub async fn start(&mut self) -> Result<()> {
        if let Some(write) = self.pending.load()? {
            info!("Restored pending edit for {} from {}", self.scope, write.updated_at);
            self.document = write.document.clone();
            self.dirty = Some(write);
            self.flush().await?;
            Ok(())
        } else {
            self.refresh().await.map(|_| ())
        }
    }

    /// Replace the local document and queue it for the server
    pub fn edit(&mut self, document: Document) -> Result<()> {
        self.document = document;
        self.record_pending()
    }

    /// Apply a locally created patch to the cache and queue the result
    pub fn apply_local_patch(&mut self, patch: &Patch) -> Result<()> {
        patch.validate()?;
        self.document = self.document.apply_patch(patch);
        self.record_pending()
    }

    /// Push the pending edit, if any
    pub async fn flush(&mut self) -> Result<FlushOutcome> {
        let Some(write) = self.dirty.clone() else {
            return Ok(FlushOutcome::Clean);
        };
        if !self.online {
            self.set_status(SyncStatus::Offline);
            return Ok(FlushOutcome::Deferred);
        }

        self.set_status(SyncStatus::Syncing);
        let result = self
            .bounded(self.transport.replace(
                &self.scope,
                &write.document,
                write.base_version,
                Some(write.updated_at),
            ))
            .await;

        match result {
            Ok(WriteOutcome::Accepted(stamp)) => {
                info!("{} saved as v{}", self.scope, stamp.version);
                self.stamp = Some(stamp);
                self.clear_pending()?;
                self.set_status(SyncStatus::Idle);
                Ok(FlushOutcome::Accepted(stamp))
            }
            Ok(WriteOutcome::Conflict(snapshot)) => {
                warn!(
                    "{} edit lost to v{}, adopting server copy",
                    self.scope, snapshot.version
                );
                self.last_conflict = Some(ConflictInfo {
                    local: write.document,
                    server: snapshot.clone(),
                });
                self.adopt(snapshot);
                self.clear_pending()?;
                self.set_status(SyncStatus::Conflict);
                Ok(FlushOutcome::Conflict)
            }
            Err(e) => self.fail(e).map(|_| FlushOutcome::Deferred),
        }
    }

    /// Fetch and adopt the server copy unless this version is already known
    pub async fn on_version_bumped(&mut self, stamp: VersionStamp) -> Result<bool> {
        if self.stamp.is_some_and(|known| known.version >= stamp.version) {
            debug!("{} already at v{}", self.scope, stamp.version);
            return Ok(false);
        }
        self.refresh().await
    }

    /// Merge a patch pushed by another peer into the local cache
    ///
    /// `stamp` is the version the patch produced on the server. When that
    /// directly follows the known version the agent moves to it, so the bump
    /// that follows needs no fetch, and an unsent edit made on the old
    /// version is carried over to the new one with the patch merged in.
    pub fn on_remote_patch(&mut self, patch: &Patch, stamp: VersionStamp) -> Result<()> {
        let known = self.stamp.map(|known| known.version);
        let follows = stamp.version == known.unwrap_or(0) + 1;

        let merged = self.document.apply_patch(patch);
        let changed = merged != self.document;
        self.document = merged;
        if follows {
            debug!("{} advanced to v{} by patch", self.scope, stamp.version);
            self.stamp = Some(stamp);
        }

        let Some(write) = &mut self.dirty else {
            return Ok(());
        };
        let rebase = follows && write.base_version == known;
        if rebase {
            write.base_version = Some(stamp.version);
            write.updated_at = write.updated_at.max(stamp.updated_at);
        }
        if changed {
            write.document = self.document.clone();
        }
        if changed || rebase {
            self.pending.save(write)?;
        }
        Ok(())
    }

    pub async fn set_online(&mut self, online: bool) -> Result<()> {
        self.online = online;
        if !online {
            self.set_status(SyncStatus::Offline);
            return Ok(());
        }
        if self.dirty.is_some() {
            self.flush().await.map(|_| ())
        } else {
            self.refresh().await.map(|_| ())
        }
    }

    /// Explicit retry: assume the network is back and push or pull now
    pub async fn sync_now(&mut self) -> Result<()> {
        self.set_online(true).await
    }

    /// Drive the agent from a command channel until Shutdown or the channel
    /// closes. Bursts of edits are coalesced into one write per debounce
    /// window.
    pub async fn run(mut self, mut commands: mpsc::Receiver<AgentCommand>) -> Self {
        let mut deadline: Option<Instant> = None;

        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Debounce,
            };

            let result = match wake {
                Wake::Debounce => {
                    deadline = None;
                    self.flush().await.map(|_| ())
                }
                Wake::Command(Some(AgentCommand::Edit(document))) => {
                    deadline = Some(Instant::now() + self.debounce);
                    self.edit(document)
                }
                Wake::Command(Some(AgentCommand::RemotePatch { patch, stamp })) => {
                    self.on_remote_patch(&patch, stamp)
                }
                Wake::Command(Some(AgentCommand::VersionBumped(stamp))) => {
                    self.on_version_bumped(stamp).await.map(|_| ())
                }
                Wake::Command(Some(AgentCommand::Online(online))) => {
                    self.set_online(online).await
                }
                Wake::Command(Some(AgentCommand::SyncNow)) => {
                    deadline = None;
                    self.sync_now().await
                }
                Wake::Command(Some(AgentCommand::Shutdown)) | Wake::Command(None) => {
                    if self.online {
                        if let Err(e) = self.flush().await {
                            warn!("Final flush for {} failed: {}", self.scope, e);
                        }
                    }
                    break;
                }
            };

            if let Err(e) = result {
                warn!("Sync agent for {}: {}", self.scope, e);
            }
        }

        debug!("Sync agent for {} stopped", self.scope);
        self
    }

    async fn refresh(&mut self) -> Result<bool> {
        if !self.online {
            self.set_status(SyncStatus::Offline);
            return Ok(false);
        }

        self.set_status(SyncStatus::Syncing);
        match self.bounded(self.transport.fetch(&self.scope)).await {
            Ok(Some(snapshot)) => {
                let status = match self.dirty.take() {
                    Some(write) => {
                        warn!(
                            "{} moved to v{}, unsent local edit lost to it",
                            self.scope, snapshot.version
                        );
                        self.last_conflict = Some(ConflictInfo {
                            local: write.document,
                            server: snapshot.clone(),
                        });
                        self.clear_pending()?;
                        SyncStatus::Conflict
                    }
                    None => SyncStatus::Idle,
                };
                self.adopt(snapshot);
                self.set_status(status);
                Ok(true)
            }
            Ok(None) => {
                self.set_status(SyncStatus::Idle);
                Ok(false)
            }
            Err(e) => self.fail(e).map(|_| false),
        }
    }

    async fn bounded<F, R>(&self, call: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        timeout(self.request_timeout, call).await?
    }

    /// Transient failures leave the agent offline with the edit kept
    fn fail(&mut self, err: SyncError) -> Result<()> {
        if err.is_retryable() {
            warn!("{} unreachable, will retry: {}", self.scope, err);
            self.online = false;
            self.set_status(SyncStatus::Offline);
            Ok(())
        } else {
            error!("{} sync failed: {}", self.scope, err);
            self.set_status(SyncStatus::Error);
            Err(err)
        }
    }

    fn adopt(&mut self, snapshot: Snapshot) {
        self.stamp = Some(snapshot.stamp());
        self.document = snapshot.document;
    }

    fn record_pending(&mut self) -> Result<()> {
        let base_version = self
            .stamp
            .map(|stamp| stamp.version)
            .or_else(|| self.dirty.as_ref().and_then(|write| write.base_version));
        let write = PendingWrite {
            document: self.document.clone(),
            updated_at: now_millis(),
            base_version,
        };
        self.pending.save(&write)?;
        self.dirty = Some(write);
        Ok(())
    }

    fn clear_pending(&mut self) -> Result<()> {
        self.dirty = None;
        self.pending.clear()
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }
}
