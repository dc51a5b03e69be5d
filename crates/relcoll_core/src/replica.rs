//! Replica lifecycle.
//!
//! A replica owns a locked work directory and the transactional replicator
//! that runs in it. Operations must follow the order
//! `new → open → promote → (writes, backups) → drop_replica`.

use crate::config::ReplicaConfig;
use crate::dir::ReplicaDir;
use crate::error::{CoreError, CoreResult};
use crate::name::ServiceName;
use crate::provider::{DefaultStateProviderFactory, StateProviderFactory};
use crate::replicator::TransactionalReplicator;
use parking_lot::{Mutex, RwLock};
use relcoll_storage::FileBackend;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How to open a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from empty state; any previous log is discarded.
    New,
    /// Recover committed state from the log.
    Existing,
}

/// Lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Constructed, not yet opened.
    Created,
    /// Log opened; reads allowed.
    Opened,
    /// Accepting writes and backups.
    Primary,
    /// Closed; state kept on disk.
    Closed,
    /// Dropped; state deleted.
    Dropped,
}

/// Told when the replica may have lost data.
///
/// Returns whether the handler changed the replica's state (for example by
/// restoring a backup).
pub trait DataLossHandler: Send + Sync {
    /// Handles suspected data loss.
    fn on_data_loss(&self, cancel: &CancellationToken) -> bool;
}

impl<F> DataLossHandler for F
where
    F: Fn(&CancellationToken) -> bool + Send + Sync,
{
    fn on_data_loss(&self, cancel: &CancellationToken) -> bool {
        self(cancel)
    }
}

/// Handler that never changes state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDataLoss;

impl DataLossHandler for NoDataLoss {
    fn on_data_loss(&self, _cancel: &CancellationToken) -> bool {
        false
    }
}

/// A single replica of a stateful service.
pub struct Replica {
    config: ReplicaConfig,
    state: RwLock<ReplicaState>,
    dir: Mutex<Option<ReplicaDir>>,
    replicator: Arc<TransactionalReplicator>,
    data_loss: Box<dyn DataLossHandler>,
}

impl Replica {
    /// Creates a replica and locks its work directory.
    ///
    /// # Errors
    ///
    /// Fails with `ReplicaLocked` if another replica uses the directory.
    pub fn new(
        config: ReplicaConfig,
        data_loss: Box<dyn DataLossHandler>,
        factory: Arc<dyn StateProviderFactory>,
    ) -> CoreResult<Self> {
        let dir = ReplicaDir::open(&config.work_dir)?;
        let replicator = Arc::new(TransactionalReplicator::with_factory(
            config.replicator.clone(),
            factory,
            dir.staging_dir(),
        ));
        tracing::debug!(
            service = %config.service_name,
            path = %dir.path().display(),
            "replica created"
        );
        Ok(Self {
            config,
            state: RwLock::new(ReplicaState::Created),
            dir: Mutex::new(Some(dir)),
            replicator,
            data_loss,
        })
    }

    /// Creates a replica with [`NoDataLoss`] and the built-in provider stores.
    pub fn with_defaults(config: ReplicaConfig) -> CoreResult<Self> {
        Self::new(config, Box::new(NoDataLoss), Arc::new(DefaultStateProviderFactory))
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Returns the owning service.
    #[must_use]
    pub fn service_name(&self) -> &ServiceName {
        &self.config.service_name
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReplicaState {
        *self.state.read()
    }

    /// Returns the replica's replicator.
    ///
    /// Available from construction so serializers can be registered before
    /// the replica opens.
    #[must_use]
    pub fn replicator(&self) -> Arc<TransactionalReplicator> {
        Arc::clone(&self.replicator)
    }

    /// Opens the replica.
    pub fn open(&self, mode: OpenMode) -> CoreResult<()> {
        let mut state = self.state.write();
        if *state != ReplicaState::Created {
            return Err(CoreError::invalid_state(format!(
                "cannot open a replica that is {state:?}"
            )));
        }

        let guard = self.dir.lock();
        let dir = guard
            .as_ref()
            .ok_or_else(|| CoreError::invalid_state("replica directory released"))?;

        match mode {
            OpenMode::New => {
                dir.remove_state()?;
                dir.save_service_name(&self.config.service_name)?;
            }
            OpenMode::Existing => {
                if let Some(stored) = dir.load_service_name()? {
                    if stored != self.config.service_name.as_str() {
                        return Err(CoreError::invalid_state(format!(
                            "directory belongs to {stored}, not {}",
                            self.config.service_name
                        )));
                    }
                }
            }
        }

        let backend = FileBackend::open(&dir.log_path())?;
        self.replicator.open(mode, Box::new(backend))?;
        *state = ReplicaState::Opened;
        tracing::info!(service = %self.config.service_name, ?mode, "replica opened");
        Ok(())
    }

    /// Promotes the replica to primary.
    pub fn promote(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        if *state != ReplicaState::Opened {
            return Err(CoreError::invalid_state(format!(
                "cannot promote a replica that is {state:?}"
            )));
        }
        self.replicator.promote()?;
        *state = ReplicaState::Primary;
        tracing::info!(service = %self.config.service_name, "replica promoted");
        Ok(())
    }

    /// Closes the replica, keeping its state on disk, and releases the lock.
    pub fn close(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        match *state {
            ReplicaState::Closed => return Ok(()),
            ReplicaState::Dropped => {
                return Err(CoreError::invalid_state("replica already dropped"))
            }
            _ => {}
        }
        self.replicator.close()?;
        self.dir.lock().take();
        *state = ReplicaState::Closed;
        tracing::info!(service = %self.config.service_name, "replica closed");
        Ok(())
    }

    /// Closes the replica and deletes its state.
    pub fn drop_replica(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        if matches!(*state, ReplicaState::Dropped | ReplicaState::Closed) {
            return Err(CoreError::invalid_state(format!(
                "cannot drop a replica that is {:?}",
                *state
            )));
        }
        self.replicator.close()?;
        if let Some(dir) = self.dir.lock().take() {
            dir.remove_state()?;
        }
        *state = ReplicaState::Dropped;
        tracing::info!(service = %self.config.service_name, "replica dropped");
        Ok(())
    }

    /// Reports suspected data loss to the handler.
    pub fn notify_data_loss(&self) -> CoreResult<bool> {
        self.notify_data_loss_with_cancellation(CancellationToken::new())
    }

    /// Reports suspected data loss; `cancel` is passed to the handler.
    pub fn notify_data_loss_with_cancellation(&self, cancel: CancellationToken) -> CoreResult<bool> {
        let state = self.state();
        if !matches!(state, ReplicaState::Opened | ReplicaState::Primary) {
            return Err(CoreError::invalid_state(format!(
                "cannot report data loss on a replica that is {state:?}"
            )));
        }
        let changed = self.data_loss.on_data_loss(&cancel);
        tracing::info!(service = %self.config.service_name, changed, "data loss handled");
        Ok(changed)
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if !matches!(*self.state.read(), ReplicaState::Closed | ReplicaState::Dropped) {
            if let Err(e) = self.replicator.close() {
                tracing::warn!(error = %e, "failed to close replicator on drop");
            }
        }
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("service", &self.config.service_name)
            .field("state", &self.state())
            .field("work_dir", &self.config.work_dir)
            .finish_non_exhaustive()
    }
}
