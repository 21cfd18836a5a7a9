// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM Worker - the runtime unit for one managed virtual machine.
//!
//! Each worker runs as its own tokio task: it connects to the bus with the
//! VM's credential, loads its domain, and then serves commands addressed to
//! the VM until it is cancelled. The hypervisor only touches a worker through
//! the lifecycle calls below ([`VmWorker::start`], [`VmWorker::terminate`],
//! [`VmWorker::disconnect`], [`VmWorker::migrate`]); the domain handle and the
//! bus session are owned by the worker.
//!
//! Worker commands and the permission guarding each:
//!
//! | Action | Attributes | Effect |
//! |--------|------------|--------|
//! | `info` | | state, names, migration state |
//! | `define` | `xml` | define the domain, embedding ownership metadata |
//! | `undefine` | | remove the definition |
//! | `create` | | start the domain |
//! | `shutdown` | | ask the guest to shut down |
//! | `destroy` | | force the domain off |
//! | `migrate` | `uri` | live-migrate to another node |

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::address::EntityAddress;
use crate::bus::{MessageBus, Stanza, StanzaBody};
use crate::driver::{DomainState, VirtDriver};
use crate::error::{Error, Result};
use crate::hooks::{HookPoint, HookRegistry};
use crate::metadata;
use crate::permissions::PermissionCenter;

/// How long lifecycle calls wait for the worker task to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands a worker serves, each guarded by the permission of the same name.
pub const WORKER_ACTIONS: &[(&str, &str)] = &[
    ("info", "Get information about the virtual machine"),
    ("define", "Define the virtual machine's domain"),
    ("undefine", "Undefine the virtual machine's domain"),
    ("create", "Start the virtual machine"),
    ("shutdown", "Shut the virtual machine down"),
    ("destroy", "Force the virtual machine off"),
    ("migrate", "Live-migrate the virtual machine"),
];

/// Migration state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Not migrating.
    Stable,
    /// Leaving this node.
    MigratingOut,
    /// Arriving on this node, not yet initialized.
    MigratingIn,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationState::Stable => "stable",
            MigrationState::MigratingOut => "migrating out",
            MigrationState::MigratingIn => "migrating in",
        })
    }
}

/// Immutable description of a managed VM.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualMachine {
    /// Unique identity, also the domain uuid.
    pub identity: String,
    /// Routable address (`identity@domain/hypervisor`).
    pub address: EntityAddress,
    /// Display name.
    pub name: String,
    /// Working directory for the VM's artifacts.
    pub folder: PathBuf,
    /// Credential for the worker's bus account.
    #[serde(skip)]
    pub credential: String,
}

#[derive(Debug)]
struct WorkerState {
    definition: Option<String>,
    migration: MigrationState,
}

/// One managed VM and its task.
pub struct VmWorker {
    vm: VirtualMachine,
    driver: Arc<dyn VirtDriver>,
    bus: Arc<dyn MessageBus>,
    hooks: HookRegistry,
    permissions: PermissionCenter,
    state: Mutex<WorkerState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for VmWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmWorker")
            .field("vm", &self.vm)
            .field("migration", &self.migration_state())
            .finish_non_exhaustive()
    }
}

impl VmWorker {
    /// Create a worker. The VM folder and its grant store are created here;
    /// nothing runs until [`start`](Self::start).
    pub async fn create(
        vm: VirtualMachine,
        driver: Arc<dyn VirtDriver>,
        bus: Arc<dyn MessageBus>,
        admins: &[String],
        migration: MigrationState,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&vm.folder).await?;
        let permissions =
            PermissionCenter::open(vm.folder.join("permissions.sqlite3"), admins).await?;
        for (name, description) in WORKER_ACTIONS {
            permissions
                .create_permission(name, description, false)
                .await?;
        }

        let hooks = HookRegistry::with_points(
            vm.address.bare(),
            &[HookPoint::EntityAuthenticated, HookPoint::VmInitialize],
        );

        Ok(Arc::new(Self {
            vm,
            driver,
            bus,
            hooks,
            permissions,
            state: Mutex::new(WorkerState {
                definition: None,
                migration,
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }))
    }

    /// The logical VM handled by this worker.
    pub fn instance(&self) -> &VirtualMachine {
        &self.vm
    }

    /// Hook points of this worker (`EntityAuthenticated`, `VmInitialize`).
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Grant store of this worker.
    pub fn permissions(&self) -> &PermissionCenter {
        &self.permissions
    }

    /// Domain descriptor, once the worker has loaded or defined one.
    pub fn definition(&self) -> Option<String> {
        self.state().definition.clone()
    }

    /// Current migration state.
    pub fn migration_state(&self) -> MigrationState {
        self.state().migration
    }

    /// Whether the worker task has been spawned.
    pub fn is_started(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// State of this worker's domain as reported by the driver.
    pub async fn domain_state(&self) -> Result<Option<DomainState>> {
        Ok(self.driver.lookup(&self.vm.identity).await?)
    }

    /// Spawn the worker task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let span = info_span!("vm_worker", identity = %self.vm.identity, name = %self.vm.name);
        let worker = self.clone();
        *task = Some(tokio::spawn(worker.run().instrument(span)));
    }

    /// Add `contact` to the VM's contact list.
    pub async fn add_contact(&self, contact: &str) -> Result<()> {
        self.bus.add_contact(&self.vm.address.bare(), contact).await?;
        Ok(())
    }

    /// Define the domain from `xml`, embedding this VM's identity and metadata.
    pub async fn define_domain(&self, xml: &str) -> Result<()> {
        let xml = metadata::prepare_definition(
            xml,
            &self.vm.identity,
            &self.vm.name,
            &self.vm.address.bare(),
            &self.vm.credential,
        )?;
        self.driver.define(&xml).await?;
        self.state().definition = Some(xml);
        info!(identity = %self.vm.identity, "Domain defined");
        Ok(())
    }

    /// Remove the domain definition.
    pub async fn undefine_domain(&self) -> Result<()> {
        self.driver.undefine(&self.vm.identity).await?;
        self.state().definition = None;
        info!(identity = %self.vm.identity, "Domain undefined");
        Ok(())
    }

    /// Start the domain.
    pub async fn start_domain(&self) -> Result<()> {
        self.require_definition()?;
        Ok(self.driver.start(&self.vm.identity).await?)
    }

    /// Ask the guest to shut down.
    pub async fn shutdown_domain(&self) -> Result<()> {
        self.require_definition()?;
        Ok(self.driver.shutdown(&self.vm.identity).await?)
    }

    /// Force the domain off.
    pub async fn destroy_domain(&self) -> Result<()> {
        self.require_definition()?;
        Ok(self.driver.destroy(&self.vm.identity).await?)
    }

    /// Force the domain off if it is active, then remove its definition.
    ///
    /// Acts only on what the driver reports for this VM's own domain; a VM
    /// without a domain is left alone.
    pub async fn teardown_domain(&self) -> Result<()> {
        let Some(state) = self.domain_state().await? else {
            self.state().definition = None;
            return Ok(());
        };
        if state.is_active() {
            self.driver.destroy(&self.vm.identity).await?;
            info!(identity = %self.vm.identity, previous = %state, "Domain destroyed");
        }
        self.undefine_domain().await
    }

    /// Live-migrate the domain to `destination_uri`.
    ///
    /// The VM is `MigratingOut` from the moment the driver is asked to move
    /// it; it returns to `Stable` only if the driver refuses. Completion is
    /// observed by the hypervisor through the domain event stream.
    pub async fn migrate(&self, destination_uri: &str) -> Result<()> {
        match self.domain_state().await? {
            Some(DomainState::Running) => {}
            other => {
                return Err(Error::InvalidState {
                    identity: self.vm.identity.clone(),
                    reason: format!(
                        "only a running domain can migrate (state: {})",
                        other.map(|s| s.to_string()).unwrap_or_else(|| "undefined".into())
                    ),
                });
            }
        }

        {
            let mut state = self.state();
            if state.migration != MigrationState::Stable {
                return Err(Error::InUse {
                    identity: self.vm.identity.clone(),
                    state: state.migration,
                });
            }
            state.migration = MigrationState::MigratingOut;
        }

        info!(identity = %self.vm.identity, destination = %destination_uri, "Starting live migration");
        if let Err(e) = self.driver.migrate(&self.vm.identity, destination_uri).await {
            self.state().migration = MigrationState::Stable;
            warn!(identity = %self.vm.identity, error = %e, "Live migration refused");
            return Err(e.into());
        }
        Ok(())
    }

    /// Copy a stopped source VM's artifacts and definition into this worker.
    ///
    /// Regular files in `source_folder` are copied except grant stores; the
    /// descriptor is rewritten for this VM and defined through the driver.
    pub async fn adopt_clone(&self, source_definition: &str, source_folder: &Path) -> Result<()> {
        let mut entries = tokio::fs::read_dir(source_folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !entry.file_type().await?.is_file() || name.contains(".sqlite3") {
                continue;
            }
            tokio::fs::copy(entry.path(), self.vm.folder.join(&file_name)).await?;
            debug!(identity = %self.vm.identity, file = %name, "Copied clone artifact");
        }

        let xml = metadata::rewrite_for_clone(
            source_definition,
            &self.vm.identity,
            &self.vm.name,
            &self.vm.address.bare(),
            &self.vm.credential,
            &source_folder.to_string_lossy(),
            &self.vm.folder.to_string_lossy(),
        )?;
        self.driver.define(&xml).await?;
        self.state().definition = Some(xml);
        info!(identity = %self.vm.identity, source = %source_folder.display(), "Clone definition adopted");
        Ok(())
    }

    /// Full termination: stop the task, remove the bus account, drop the folder.
    ///
    /// Every step runs even when a previous one failed; failures are logged.
    pub async fn terminate(&self) {
        self.stop_task().await;
        if let Err(e) = self.bus.unregister(&self.vm.address.bare()).await {
            warn!(identity = %self.vm.identity, error = %e, "Failed to unregister bus account");
        }
        self.permissions.close().await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.vm.folder).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(identity = %self.vm.identity, error = %e, "Failed to remove VM folder");
        }
        info!(identity = %self.vm.identity, "Worker terminated");
    }

    /// Light termination: stop the task and close the connection, keeping the
    /// bus account and the folder. Used when the VM leaves through migration
    /// and when the hypervisor shuts down.
    pub async fn disconnect(&self) {
        self.stop_task().await;
        if let Err(e) = self.bus.disconnect(&self.vm.address.bare()).await {
            warn!(identity = %self.vm.identity, error = %e, "Failed to disconnect worker");
        }
        self.permissions.close().await;
        info!(identity = %self.vm.identity, "Worker disconnected");
    }

    async fn stop_task(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(identity = %self.vm.identity, "Worker task panicked: {}", e),
                Err(_) => warn!(identity = %self.vm.identity, "Worker task did not stop in time"),
            }
        }
    }

    async fn run(self: Arc<Self>) {
        self.serve().await;
        // An arrival that never initialized must still be freeable.
        let mut state = self.state();
        if state.migration == MigrationState::MigratingIn {
            warn!("Arrival did not initialize; marking the virtual machine stable");
            state.migration = MigrationState::Stable;
        }
    }

    async fn serve(&self) {
        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            session = self.bus.connect(&self.vm.address, &self.vm.credential) => match session {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "Worker failed to connect");
                    return;
                }
            },
        };
        info!(address = %session.address, "Worker connected");

        let address = json!({ "address": self.vm.address.bare() });
        self.hooks
            .fire(HookPoint::EntityAuthenticated, address.clone())
            .await;

        if let Err(e) = self.refresh_domain().await {
            warn!(error = %e, "Failed to load domain");
        }
        self.hooks.fire(HookPoint::VmInitialize, address).await;
        {
            let mut state = self.state();
            if state.migration == MigrationState::MigratingIn {
                state.migration = MigrationState::Stable;
            }
        }

        let mut inbox = session.inbox;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                stanza = inbox.recv() => match stanza {
                    Some(stanza) => self.handle_stanza(stanza).await,
                    None => {
                        debug!("Worker inbox closed");
                        break;
                    }
                },
            }
        }
        info!("Worker stopped");
    }

    async fn refresh_domain(&self) -> Result<()> {
        let definition = match self.driver.lookup(&self.vm.identity).await? {
            Some(_) => Some(self.driver.xml_desc(&self.vm.identity).await?),
            None => None,
        };
        self.state().definition = definition;
        Ok(())
    }

    async fn handle_stanza(&self, stanza: Stanza) {
        let StanzaBody::Request { action, attributes } = &stanza.body else {
            debug!(id = %stanza.id, "Ignoring unsolicited reply");
            return;
        };

        let outcome = match self.permissions.check(&stanza.from, action).await {
            Ok(true) => self.execute(action, attributes).await,
            Ok(false) => Err(Error::PermissionDenied {
                user: stanza.from.clone(),
                permission: action.clone(),
            }),
            Err(e) => Err(e),
        };

        let reply = match outcome {
            Ok(payload) => stanza.reply_result(payload),
            Err(e) => {
                warn!(action = %action, from = %stanza.from, error = %e, "Worker command failed");
                let code = match &e {
                    Error::Virtualization(d) => d.code(),
                    _ => -1,
                };
                stanza.reply_error(code, e.error_code(), e.to_string())
            }
        };
        if let Err(e) = self.bus.send(reply).await {
            warn!(id = %stanza.id, error = %e, "Failed to deliver worker reply");
        }
    }

    async fn execute(
        &self,
        action: &str,
        attributes: &std::collections::BTreeMap<String, String>,
    ) -> Result<Value> {
        let attribute = |key: &str| {
            attributes
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| Error::InvalidRequest(format!("{action} requires {key:?}")))
        };
        match action {
            "info" => {
                let state = self.domain_state().await?;
                Ok(json!({
                    "identity": self.vm.identity,
                    "address": self.vm.address.bare(),
                    "name": self.vm.name,
                    "state": state,
                    "defined": self.definition().is_some(),
                    "migration_state": self.migration_state(),
                }))
            }
            "define" => self.define_domain(attribute("xml")?).await.map(|_| Value::Null),
            "undefine" => self.undefine_domain().await.map(|_| Value::Null),
            "create" => self.start_domain().await.map(|_| Value::Null),
            "shutdown" => self.shutdown_domain().await.map(|_| Value::Null),
            "destroy" => self.destroy_domain().await.map(|_| Value::Null),
            "migrate" => self.migrate(attribute("uri")?).await.map(|_| Value::Null),
            other => Err(Error::InvalidRequest(format!("no such action: {other}"))),
        }
    }

    fn require_definition(&self) -> Result<()> {
        if self.state().definition.is_none() {
            return Err(Error::InvalidState {
                identity: self.vm.identity.clone(),
                reason: "no domain is defined".to_string(),
            });
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
