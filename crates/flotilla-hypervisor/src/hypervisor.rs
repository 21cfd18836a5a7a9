// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor Orchestrator.
//!
//! Owns the in-memory registry (identity -> [`VmWorker`]) together with the
//! durable [`RegistryStore`], the hypervisor's [`PermissionCenter`] and its
//! [`HookRegistry`], and exposes the VM lifecycle operations.
//!
//! # Consistency
//!
//! Every mutation of the registry (alloc, free, clone, and the migration
//! variants) runs its commit phase while holding the registry's write guard:
//! the durable write and the map update happen inside the same critical
//! section, so readers (which take the read guard) never observe one without
//! the other. Hooks fire and workers start after the guard is released.
//! `free` tears the domain and the worker down before taking the guard; a
//! per-identity claim keeps two frees of the same VM apart.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::EntityAddress;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::driver::VirtDriver;
use crate::error::{Error, Result};
use crate::hooks::{self, HookPoint, HookRegistry};
use crate::names::{NameGenerator, apply_space_policy};
use crate::permissions::{self, PermissionCenter};
use crate::registry_store::{RegistryStore, VmRecord};
use crate::worker::{MigrationState, VirtualMachine, VmWorker};

/// Permissions declared on the hypervisor's grant store.
pub const HYPERVISOR_PERMISSIONS: &[(&str, &str)] = &[
    ("alloc", "Allocate new virtual machines"),
    ("free", "Free virtual machines"),
    ("rostervm", "List the virtual machines of this hypervisor"),
    ("clone", "Clone stopped virtual machines"),
    ("ip", "Get the hypervisor's IP address"),
    ("uri", "Get the hypervisor's virtualization URI"),
    ("capabilities", "Get the hypervisor's capabilities"),
    ("migration", "Allocate or free migrating virtual machines"),
];

/// Hook points exposed by the hypervisor.
pub const HYPERVISOR_HOOKS: &[HookPoint] = &[
    HookPoint::HypervisorAlloc,
    HookPoint::HypervisorFree,
    HookPoint::HypervisorMigratedVmLeave,
    HookPoint::HypervisorMigratedVmArrive,
    HookPoint::HypervisorClone,
];

/// How a new VM gets its display name.
#[derive(Debug, Clone)]
enum NameChoice {
    Requested(String),
    Generated,
    CloneOf(String),
}

/// One roster line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    /// Bare address of the VM.
    pub address: String,
    /// VM identity.
    pub identity: String,
    /// Display name.
    pub name: String,
}

/// The hypervisor orchestrator.
pub struct Hypervisor {
    config: Config,
    address: EntityAddress,
    driver: Arc<dyn VirtDriver>,
    bus: Arc<dyn MessageBus>,
    permissions: PermissionCenter,
    hooks: HookRegistry,
    store: RegistryStore,
    names: NameGenerator,
    capabilities: OnceCell<String>,
    registry: RwLock<HashMap<String, Arc<VmWorker>>>,
    freeing: Mutex<HashSet<String>>,
}

/// Marks an identity as being freed until dropped.
struct FreeClaim<'a> {
    freeing: &'a Mutex<HashSet<String>>,
    identity: String,
}

impl<'a> FreeClaim<'a> {
    fn acquire(freeing: &'a Mutex<HashSet<String>>, identity: &str) -> Result<Self> {
        let mut set = freeing.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(identity.to_string()) {
            return Err(Error::InvalidState {
                identity: identity.to_string(),
                reason: "the virtual machine is already being freed".to_string(),
            });
        }
        Ok(Self {
            freeing,
            identity: identity.to_string(),
        })
    }
}

impl Drop for FreeClaim<'_> {
    fn drop(&mut self) {
        self.freeing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.identity);
    }
}

impl std::fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hypervisor")
            .field("address", &self.address)
            .field("driver", &self.driver.driver_type())
            .finish_non_exhaustive()
    }
}

impl Hypervisor {
    /// Open the stores and replay every persisted VM.
    ///
    /// Each stored row gets a worker that is started immediately. Replay never
    /// writes to the store it reads from.
    pub async fn open(
        config: Config,
        driver: Arc<dyn VirtDriver>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Arc<Self>> {
        let address = EntityAddress::new(&config.hypervisor_name, &config.routing_domain, None);

        let store = RegistryStore::open(&config.registry_database).await?;
        let permissions =
            PermissionCenter::open(&config.permissions_database, &config.root_admins).await?;
        for (name, description) in HYPERVISOR_PERMISSIONS {
            permissions
                .create_permission(name, description, false)
                .await?;
        }

        let names = match &config.names_file {
            Some(path) => NameGenerator::from_file(path)?,
            None => NameGenerator::default(),
        };

        let capabilities = OnceCell::new();
        match driver.capabilities().await {
            Ok(caps) => {
                let _ = capabilities.set(caps);
            }
            Err(e) => warn!(error = %e, "Failed to read capabilities; will retry on demand"),
        }

        let hypervisor = Arc::new(Self {
            hooks: HookRegistry::with_points(address.bare(), HYPERVISOR_HOOKS),
            address,
            config,
            driver,
            bus,
            permissions,
            store,
            names,
            capabilities,
            registry: RwLock::new(HashMap::new()),
            freeing: Mutex::new(HashSet::new()),
        });

        hypervisor.replay().await?;
        info!(
            address = %hypervisor.address,
            driver = hypervisor.driver.driver_type(),
            vms = hypervisor.vm_count().await,
            "Hypervisor ready"
        );
        Ok(hypervisor)
    }

    /// Bare address of the hypervisor.
    pub fn address(&self) -> &EntityAddress {
        &self.address
    }

    /// Configuration the hypervisor was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hypervisor hook points.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Hypervisor grant store.
    pub fn permissions(&self) -> &PermissionCenter {
        &self.permissions
    }

    /// Durable registry.
    pub fn registry_store(&self) -> &RegistryStore {
        &self.store
    }

    /// Message bus shared with the workers.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub(crate) fn driver(&self) -> &Arc<dyn VirtDriver> {
        &self.driver
    }

    /// Allocate a new VM.
    ///
    /// When `requester` is given it receives every permission on the VM and
    /// is added to the VM's contacts once the worker authenticates. With
    /// `start == false` the worker is returned unstarted so the caller can
    /// attach more one-shot hooks first.
    pub async fn alloc(
        &self,
        requester: Option<&str>,
        requested_name: Option<&str>,
        start: bool,
    ) -> Result<Arc<VmWorker>> {
        let choice = match requested_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => NameChoice::Requested(name.to_string()),
            None => NameChoice::Generated,
        };
        self.alloc_with(requester, choice, start).await
    }

    async fn alloc_with(
        &self,
        requester: Option<&str>,
        choice: NameChoice,
        start: bool,
    ) -> Result<Arc<VmWorker>> {
        let worker = {
            let mut registry = self.registry.write().await;
            let name = self.resolve_name(&registry, choice)?;
            let identity = Uuid::new_v4().to_string();
            let vm = self.virtual_machine(
                &identity,
                &self.config.routing_domain,
                &name,
                generate_credential(self.config.credential_length),
            );

            let worker = VmWorker::create(
                vm,
                self.driver.clone(),
                self.bus.clone(),
                &self.config.root_admins,
                MigrationState::Stable,
            )
            .await?;

            if let Some(requester) = requester
                && let Err(e) = self.attach_requester(&worker, requester).await
            {
                abandon(&worker).await;
                return Err(e);
            }

            if let Err(e) = self.commit_insert(&mut registry, &worker).await {
                abandon(&worker).await;
                return Err(e);
            }
            worker
        };

        let vm = worker.instance();
        info!(identity = %vm.identity, name = %vm.name, requester = ?requester, "Virtual machine allocated");
        self.hooks
            .fire(HookPoint::HypervisorAlloc, vm_payload(vm))
            .await;
        if start {
            worker.start();
        }
        Ok(worker)
    }

    /// Register a VM that arrived through live migration and start it.
    ///
    /// Identity, name and credential come from the migrating VM. No requester
    /// bookkeeping happens. Calling it again for a registered identity returns
    /// the existing worker.
    pub async fn alloc_for_migration(
        &self,
        address: &str,
        name: &str,
        credential: &str,
    ) -> Result<Arc<VmWorker>> {
        let parsed = EntityAddress::parse(address)?;
        let identity = parsed.node.clone();

        let worker = {
            let mut registry = self.registry.write().await;
            if let Some(existing) = registry.get(&identity) {
                debug!(identity = %identity, "Migrated VM already registered");
                return Ok(existing.clone());
            }

            let vm = self.virtual_machine(&identity, &parsed.domain, name, credential.to_string());
            let worker = VmWorker::create(
                vm,
                self.driver.clone(),
                self.bus.clone(),
                &self.config.root_admins,
                MigrationState::MigratingIn,
            )
            .await?;
            if let Err(e) = self.commit_insert(&mut registry, &worker).await {
                worker.disconnect().await;
                return Err(e);
            }
            worker
        };

        worker.start();
        info!(identity = %identity, name = %name, "Migrated virtual machine registered");
        Ok(worker)
    }

    /// Free a VM: stop and undefine its domain, terminate its worker, and drop
    /// it from the registry.
    ///
    /// Refused with [`Error::InUse`] while the VM is migrating. Driver
    /// failures while tearing down the domain abort the operation; once the
    /// worker's termination has been invoked, the identity always leaves the
    /// in-memory registry.
    pub async fn free(&self, identity: &str) -> Result<()> {
        let identity = identity.to_lowercase();
        let worker = self
            .get_vm_by_uuid(&identity)
            .await
            .ok_or_else(|| Error::NotFound(identity.clone()))?;

        let state = worker.migration_state();
        if state != MigrationState::Stable {
            return Err(Error::InUse { identity, state });
        }
        let _claim = FreeClaim::acquire(&self.freeing, &identity)?;
        if self
            .get_vm_by_uuid(&identity)
            .await
            .is_none_or(|current| !Arc::ptr_eq(&current, &worker))
        {
            return Err(Error::NotFound(identity));
        }

        // Teardown runs outside the registry guard; readers keep seeing the
        // VM until the commit below.
        worker.teardown_domain().await?;
        worker.terminate().await;

        let deleted = {
            let mut registry = self.registry.write().await;
            let deleted = self.store.delete(&worker.instance().address.bare()).await;
            registry.remove(&identity);
            deleted
        };

        info!(identity = %identity, "Virtual machine freed");
        self.hooks
            .fire(HookPoint::HypervisorFree, vm_payload(worker.instance()))
            .await;
        deleted.map(|_| ())
    }

    /// Drop a VM that left through live migration.
    ///
    /// The worker is disconnected without removing its bus account, the row is
    /// deleted and the identity leaves the registry. Does not fire
    /// `HypervisorFree`; the caller fires `HypervisorMigratedVmLeave`.
    pub async fn free_for_migration(&self, identity: &str) -> Result<Arc<VmWorker>> {
        let identity = identity.to_lowercase();
        let mut registry = self.registry.write().await;
        let worker = registry
            .get(&identity)
            .cloned()
            .ok_or_else(|| Error::NotFound(identity.clone()))?;

        // A persistent copy may survive the move on this node.
        match worker.domain_state().await {
            Ok(Some(_)) => {
                if let Err(e) = worker.undefine_domain().await {
                    warn!(identity = %identity, error = %e, "Failed to undefine departed domain");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, error = %e, "Failed to inspect departed domain"),
        }
        worker.disconnect().await;

        let deleted = self.store.delete(&worker.instance().address.bare()).await;
        registry.remove(&identity);
        drop(registry);

        info!(identity = %identity, "Migrated virtual machine released");
        deleted.map(|_| worker)
    }

    /// Clone a stopped, defined VM.
    ///
    /// The new VM is allocated unstarted; a one-shot `VmInitialize` hook on it
    /// copies the source's artifacts and definition once its worker has
    /// initialized, then the worker is started.
    pub async fn clone_vm(
        &self,
        identity: &str,
        requester: Option<&str>,
        wanted_name: Option<&str>,
    ) -> Result<Arc<VmWorker>> {
        let source = self
            .get_vm_by_uuid(identity)
            .await
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;
        let source_vm = source.instance();

        let definition = source.definition().ok_or_else(|| Error::InvalidState {
            identity: source_vm.identity.clone(),
            reason: "the source virtual machine has to be defined to be cloned".to_string(),
        })?;
        match source.domain_state().await? {
            Some(state) if state.is_stopped() => {}
            other => {
                return Err(Error::InvalidState {
                    identity: source_vm.identity.clone(),
                    reason: format!(
                        "the source virtual machine has to be stopped to be cloned (state: {})",
                        other.map(|s| s.to_string()).unwrap_or_else(|| "undefined".into())
                    ),
                });
            }
        }

        let choice = match wanted_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => NameChoice::Requested(name.to_string()),
            None => NameChoice::CloneOf(source_vm.name.clone()),
        };
        let clone = self.alloc_with(requester, choice, false).await?;

        let target = Arc::downgrade(&clone);
        let source_folder = source_vm.folder.clone();
        let source_identity = source_vm.identity.clone();
        clone.hooks().register(
            HookPoint::VmInitialize,
            hooks::callback(move |_| {
                let target = target.clone();
                let definition = definition.clone();
                let source_folder = source_folder.clone();
                async move {
                    let Some(target) = target.upgrade() else {
                        return;
                    };
                    if let Err(e) = target.adopt_clone(&definition, &source_folder).await {
                        error!(
                            identity = %target.instance().identity,
                            error = %e,
                            "Failed to populate clone"
                        );
                    }
                }
            }),
            Some(json!({ "source": source_identity })),
            true,
        )?;
        clone.start();

        info!(
            source = %source_vm.identity,
            identity = %clone.instance().identity,
            name = %clone.instance().name,
            "Virtual machine cloned"
        );
        self.hooks
            .fire(HookPoint::HypervisorClone, vm_payload(clone.instance()))
            .await;
        Ok(clone)
    }

    /// Worker registered under `identity`.
    pub async fn get_vm_by_uuid(&self, identity: &str) -> Option<Arc<VmWorker>> {
        self.registry
            .read()
            .await
            .get(&identity.to_lowercase())
            .cloned()
    }

    /// Worker whose display name matches `name`, ignoring case.
    pub async fn get_vm_by_name(&self, name: &str) -> Option<Arc<VmWorker>> {
        let registry = self.registry.read().await;
        find_by_name(&registry, name).cloned()
    }

    /// Resolve a display name, an identity, or an address.
    pub async fn get_vm_by_identifier(&self, identifier: &str) -> Option<Arc<VmWorker>> {
        let registry = self.registry.read().await;
        if let Some(worker) = find_by_name(&registry, identifier) {
            return Some(worker.clone());
        }
        if let Some(worker) = registry.get(&identifier.trim().to_lowercase()) {
            return Some(worker.clone());
        }
        EntityAddress::parse(identifier)
            .ok()
            .and_then(|a| registry.get(&a.node).cloned())
    }

    /// Bare addresses of every registered VM, sorted.
    pub async fn roster(&self) -> Vec<String> {
        let mut roster: Vec<String> = self
            .registry
            .read()
            .await
            .values()
            .map(|w| w.instance().address.bare())
            .collect();
        roster.sort();
        roster
    }

    /// Roster with names, sorted by address.
    pub async fn roster_entries(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .registry
            .read()
            .await
            .values()
            .map(|w| {
                let vm = w.instance();
                RosterEntry {
                    address: vm.address.bare(),
                    identity: vm.identity.clone(),
                    name: vm.name.clone(),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    /// Identities of every registered VM.
    pub async fn identities(&self) -> Vec<String> {
        self.registry.read().await.keys().cloned().collect()
    }

    /// Number of registered VMs.
    pub async fn vm_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Advertised IP address.
    pub fn ip(&self) -> &str {
        &self.config.ip
    }

    /// URI peers use to migrate domains here.
    pub fn migration_libvirt_uri(&self) -> String {
        match &self.config.migration_uri {
            Some(uri) => uri.clone(),
            None => self
                .config
                .libvirt_uri
                .replace("///", &format!("//{}/", self.config.ip)),
        }
    }

    /// Host capabilities, fetched once from the driver.
    pub async fn capabilities(&self) -> Result<String> {
        let caps = self
            .capabilities
            .get_or_try_init(|| async { self.driver.capabilities().await })
            .await?;
        Ok(caps.clone())
    }

    /// Disconnect every worker without unregistering it or touching the store.
    ///
    /// The next [`open`](Self::open) replays them.
    pub async fn shutdown_workers(&self) {
        let workers: Vec<Arc<VmWorker>> = {
            let mut registry = self.registry.write().await;
            registry.drain().map(|(_, w)| w).collect()
        };
        let count = workers.len();
        futures::future::join_all(workers.iter().map(|w| w.disconnect())).await;
        self.permissions.close().await;
        self.store.close().await;
        info!(workers = count, "Hypervisor workers disconnected");
    }

    async fn replay(&self) -> Result<()> {
        let records = self.store.list_all().await?;
        let mut registry = self.registry.write().await;
        for record in records {
            match self.revive(&record).await {
                Ok(worker) => {
                    registry.insert(worker.instance().identity.clone(), worker.clone());
                    worker.start();
                }
                Err(e) => {
                    error!(address = %record.address, error = %e, "Failed to restore virtual machine");
                }
            }
        }
        debug!(vms = registry.len(), "Registry replayed");
        Ok(())
    }

    async fn revive(&self, record: &VmRecord) -> Result<Arc<VmWorker>> {
        let address = EntityAddress::parse(&record.address)?;
        let vm = self.virtual_machine(
            &address.node,
            &address.domain,
            &record.display_name,
            record.credential.clone(),
        );
        VmWorker::create(
            vm,
            self.driver.clone(),
            self.bus.clone(),
            &self.config.root_admins,
            MigrationState::Stable,
        )
        .await
    }

    async fn attach_requester(&self, worker: &Arc<VmWorker>, requester: &str) -> Result<()> {
        worker
            .permissions()
            .grant(requester, permissions::ALL)
            .await?;

        let target = Arc::downgrade(worker);
        let contact = requester.to_string();
        worker.hooks().register(
            HookPoint::EntityAuthenticated,
            hooks::callback(move |_| {
                let target = target.clone();
                let contact = contact.clone();
                async move {
                    let Some(target) = target.upgrade() else {
                        return;
                    };
                    if let Err(e) = target.add_contact(&contact).await {
                        warn!(contact = %contact, error = %e, "Failed to add requester to contacts");
                    }
                }
            }),
            Some(json!({ "requester": requester })),
            true,
        )?;
        Ok(())
    }

    async fn commit_insert(
        &self,
        registry: &mut HashMap<String, Arc<VmWorker>>,
        worker: &Arc<VmWorker>,
    ) -> Result<()> {
        let vm = worker.instance();
        self.store
            .insert(&VmRecord {
                address: vm.address.bare(),
                credential: vm.credential.clone(),
                created_at: Utc::now(),
                annotation: String::new(),
                display_name: vm.name.clone(),
            })
            .await?;
        registry.insert(vm.identity.clone(), worker.clone());
        Ok(())
    }

    fn resolve_name(
        &self,
        registry: &HashMap<String, Arc<VmWorker>>,
        choice: NameChoice,
    ) -> Result<String> {
        let allow_blank = self.config.allow_blank_space_in_vm_name;
        let taken = |name: &str| find_by_name(registry, name).is_some();
        match choice {
            NameChoice::Requested(name) => {
                let name = apply_space_policy(&name, allow_blank);
                if taken(&name) {
                    return Err(Error::NameConflict(name));
                }
                Ok(name)
            }
            NameChoice::Generated => {
                let compose = |base: &str| apply_space_policy(base, allow_blank);
                let base = self.names.generate(|base| taken(&compose(base)))?;
                Ok(compose(&base))
            }
            NameChoice::CloneOf(source) => {
                let compose =
                    |base: &str| apply_space_policy(&format!("{base} (clone of {source})"), allow_blank);
                let base = self.names.generate(|base| taken(&compose(base)))?;
                Ok(compose(&base))
            }
        }
    }

    fn virtual_machine(
        &self,
        identity: &str,
        domain: &str,
        name: &str,
        credential: String,
    ) -> VirtualMachine {
        let identity = identity.to_lowercase();
        VirtualMachine {
            address: EntityAddress::new(&identity, domain, Some(&self.address.node)),
            folder: vm_folder(&self.config.vm_dir, &identity),
            identity,
            name: name.to_string(),
            credential,
        }
    }
}

fn find_by_name<'a>(
    registry: &'a HashMap<String, Arc<VmWorker>>,
    name: &str,
) -> Option<&'a Arc<VmWorker>> {
    let wanted = name.trim().to_lowercase();
    registry
        .values()
        .find(|w| w.instance().name.to_lowercase() == wanted)
}

fn vm_folder(vm_dir: &Path, identity: &str) -> std::path::PathBuf {
    vm_dir.join(identity)
}

fn generate_credential(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn vm_payload(vm: &VirtualMachine) -> Value {
    serde_json::to_value(vm).unwrap_or(Value::Null)
}

/// Undo a worker that never made it into the registry.
async fn abandon(worker: &VmWorker) {
    worker.permissions().close().await;
    if let Err(e) = tokio::fs::remove_dir_all(&worker.instance().folder).await {
        warn!(identity = %worker.instance().identity, error = %e, "Failed to remove abandoned VM folder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_credential() {
        let credential = generate_credential(24);
        assert_eq!(credential.len(), 24);
        assert!(credential.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(credential, generate_credential(24));
    }

    #[test]
    fn test_vm_folder() {
        assert_eq!(
            vm_folder(Path::new("/data/vms"), "abc"),
            Path::new("/data/vms/abc")
        );
    }
}
