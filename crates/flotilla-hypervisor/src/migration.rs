// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration state machine.
//!
//! Live migrations are observed through the driver's lifecycle events rather
//! than through RPC:
//!
//! | Event | Transition |
//! |-------|------------|
//! | stopped / migrated | `free_for_migration`, then `HypervisorMigratedVmLeave` |
//! | resumed / migrated | `alloc_for_migration`, then `HypervisorMigratedVmArrive` |
//!
//! Every other event is ignored. Handlers never fail outward: a domain
//! without flotilla metadata is not ours, and anything malformed is logged and
//! dropped.
//!
//! [`MigrationEventListener`] consumes the driver's event stream on a single
//! task, so events for one domain are handled in the order they arrive.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::driver::{DomainEvent, DriverError, LifecycleEvent, ResumedReason, StoppedReason};
use crate::error::Error;
use crate::hooks::HookPoint;
use crate::hypervisor::Hypervisor;
use crate::metadata::DomainMetadata;

impl Hypervisor {
    /// React to one lifecycle event from the virtualization layer.
    pub async fn handle_domain_event(&self, event: DomainEvent) {
        match event.event {
            LifecycleEvent::Stopped(StoppedReason::Migrated) => self.on_migrated_out(event).await,
            LifecycleEvent::Resumed(ResumedReason::Migrated) => self.on_migrated_in(event).await,
            other => debug!(domain = %event.domain, event = ?other, "Ignoring lifecycle event"),
        }
    }

    async fn on_migrated_out(&self, event: DomainEvent) {
        let Some(identity) = self.departing_identity(&event).await else {
            debug!(domain = %event.domain, "Departed domain is not managed here");
            return;
        };

        match self.free_for_migration(&identity).await {
            Ok(worker) => {
                info!(identity = %identity, "Virtual machine migrated away");
                let payload = serde_json::to_value(worker.instance()).unwrap_or_default();
                self.hooks()
                    .fire(HookPoint::HypervisorMigratedVmLeave, payload)
                    .await;
            }
            Err(Error::NotFound(_)) => {
                debug!(identity = %identity, "Departed virtual machine already released");
            }
            Err(e) => warn!(identity = %identity, error = %e, "Failed to release migrated virtual machine"),
        }
    }

    async fn on_migrated_in(&self, event: DomainEvent) {
        let xml = match event.xml {
            Some(xml) => xml,
            None => match self.driver().xml_desc(&event.domain).await {
                Ok(xml) => xml,
                Err(e) => {
                    warn!(domain = %event.domain, error = %e, "Cannot read arriving domain");
                    return;
                }
            },
        };

        let metadata = match DomainMetadata::parse(&xml) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                debug!(domain = %event.domain, "Arriving domain carries no metadata; not ours");
                return;
            }
            Err(e) => {
                warn!(domain = %event.domain, error = %e, "Arriving domain has invalid metadata");
                return;
            }
        };

        match self
            .alloc_for_migration(&metadata.address, &metadata.name, &metadata.credential)
            .await
        {
            Ok(worker) => {
                info!(identity = %metadata.identity(), "Virtual machine migrated in");
                let payload = serde_json::to_value(worker.instance()).unwrap_or_default();
                self.hooks()
                    .fire(HookPoint::HypervisorMigratedVmArrive, payload)
                    .await;
            }
            Err(e) => warn!(
                address = %metadata.address,
                error = %e,
                "Failed to register migrated virtual machine"
            ),
        }
    }

    /// Identity of a departing domain: its embedded metadata when readable,
    /// otherwise the domain reference resolved against the registry.
    async fn departing_identity(&self, event: &DomainEvent) -> Option<String> {
        if let Some(xml) = &event.xml {
            match DomainMetadata::parse(xml) {
                Ok(Some(metadata)) => return Some(metadata.identity().to_string()),
                Ok(None) => {}
                Err(e) => warn!(domain = %event.domain, error = %e, "Departed domain has invalid metadata"),
            }
        }
        self.get_vm_by_identifier(&event.domain)
            .await
            .map(|w| w.instance().identity.clone())
    }
}

/// Background consumer of the driver's lifecycle events.
pub struct MigrationEventListener {
    hypervisor: Arc<Hypervisor>,
    events: mpsc::Receiver<DomainEvent>,
    shutdown: Arc<Notify>,
}

impl MigrationEventListener {
    /// Subscribe to the hypervisor driver's lifecycle events.
    ///
    /// Fails with [`DriverError::EventsUnsupported`] when the driver cannot
    /// deliver events; the hypervisor then runs without migration
    /// reconciliation.
    pub async fn subscribe(hypervisor: Arc<Hypervisor>) -> Result<Self, DriverError> {
        let events = hypervisor.driver().subscribe_lifecycle().await?;
        Ok(Self::new(hypervisor, events))
    }

    /// Listener over an existing event stream.
    pub fn new(hypervisor: Arc<Hypervisor>, events: mpsc::Receiver<DomainEvent>) -> Self {
        Self {
            hypervisor,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to trigger shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown or until the event stream ends.
    pub async fn run(mut self) {
        info!("Migration event listener started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Migration event listener shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.hypervisor.handle_domain_event(event).await,
                    None => {
                        warn!("Lifecycle event stream closed; migration reconciliation unavailable");
                        break;
                    }
                },
            }
        }
    }
}
