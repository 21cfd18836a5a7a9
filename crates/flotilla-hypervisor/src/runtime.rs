// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the hypervisor agent.
//!
//! [`HypervisorRuntime`] opens the [`Hypervisor`], subscribes to the driver's
//! lifecycle events, and serves the control listener, all inside an existing
//! tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flotilla_hypervisor::bus::LocalBus;
//! use flotilla_hypervisor::config::Config;
//! use flotilla_hypervisor::driver::VirshDriver;
//! use flotilla_hypervisor::runtime::HypervisorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = HypervisorRuntime::builder()
//!         .driver(Arc::new(VirshDriver::new(&config.libvirt_uri)))
//!         .bus(Arc::new(LocalBus::new()))
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! When the driver cannot deliver lifecycle events the runtime still starts;
//! direct operations work and migration reconciliation is unavailable.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::config::Config;
use crate::dispatcher::CommandDispatcher;
use crate::driver::VirtDriver;
use crate::hypervisor::Hypervisor;
use crate::migration::MigrationEventListener;
use crate::server::run_control_server;

/// Builder for creating a [`HypervisorRuntime`].
#[derive(Default)]
pub struct HypervisorRuntimeBuilder {
    config: Option<Config>,
    driver: Option<Arc<dyn VirtDriver>>,
    bus: Option<Arc<dyn MessageBus>>,
    bind_addr: Option<SocketAddr>,
}

impl HypervisorRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the virtualization driver (required).
    pub fn driver(mut self, driver: Arc<dyn VirtDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the message bus (required).
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the control listener address.
    ///
    /// Default: `config.control_addr`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Validate the builder.
    pub fn build(self) -> Result<HypervisorRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;
        let bus = self.bus.ok_or_else(|| anyhow::anyhow!("bus is required"))?;
        let bind_addr = self.bind_addr.unwrap_or(config.control_addr);

        Ok(HypervisorRuntimeConfig {
            config,
            driver,
            bus,
            bind_addr,
        })
    }
}

/// Validated runtime configuration.
pub struct HypervisorRuntimeConfig {
    config: Config,
    driver: Arc<dyn VirtDriver>,
    bus: Arc<dyn MessageBus>,
    bind_addr: SocketAddr,
}

impl HypervisorRuntimeConfig {
    /// Open the hypervisor and spawn the event listener and control listener.
    pub async fn start(self) -> Result<HypervisorRuntime> {
        let hypervisor = Hypervisor::open(self.config, self.driver, self.bus).await?;

        let (listener_handle, listener_shutdown) =
            match MigrationEventListener::subscribe(hypervisor.clone()).await {
                Ok(listener) => {
                    let shutdown = listener.shutdown_handle();
                    (Some(tokio::spawn(listener.run())), Some(shutdown))
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Lifecycle events unavailable; running without migration reconciliation"
                    );
                    (None, None)
                }
            };

        let dispatcher = Arc::new(CommandDispatcher::new(hypervisor.clone()));
        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_control_server(
            listener,
            dispatcher.clone(),
            server_shutdown_rx,
        ));

        info!(
            bind_addr = %bind_addr,
            address = %hypervisor.address(),
            migration_events = listener_handle.is_some(),
            "HypervisorRuntime started"
        );

        Ok(HypervisorRuntime {
            hypervisor,
            dispatcher,
            server_handle,
            server_shutdown_tx,
            listener_handle,
            listener_shutdown,
            bind_addr,
        })
    }
}

/// A running hypervisor agent.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination: workers are
/// disconnected but stay registered, so the next start replays them.
pub struct HypervisorRuntime {
    hypervisor: Arc<Hypervisor>,
    dispatcher: Arc<CommandDispatcher>,
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    listener_handle: Option<JoinHandle<()>>,
    listener_shutdown: Option<Arc<Notify>>,
    bind_addr: SocketAddr,
}

impl HypervisorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HypervisorRuntimeBuilder {
        HypervisorRuntimeBuilder::new()
    }

    /// Address the control listener is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The orchestrator.
    pub fn hypervisor(&self) -> &Arc<Hypervisor> {
        &self.hypervisor
    }

    /// The command dispatcher.
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Whether migration reconciliation is active.
    pub fn migration_events_enabled(&self) -> bool {
        self.listener_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Check if the control listener is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("HypervisorRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        if let Some(shutdown) = &self.listener_shutdown {
            shutdown.notify_one();
        }

        if let Some(handle) = self.listener_handle
            && let Err(e) = handle.await
        {
            error!("Migration event listener panicked: {}", e);
        }

        let server_result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("control listener panicked: {}", e)),
        };

        self.hypervisor.shutdown_workers().await;

        match server_result {
            Ok(()) => {
                info!("HypervisorRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Control listener error during shutdown: {}", e);
                Err(e)
            }
        }
    }
}
