// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flotilla Hypervisor - standalone agent
//!
//! Runs the hypervisor against the local libvirt daemon (through `virsh`) with
//! an in-process message bus; the control listener is the external entry
//! point.

use std::sync::Arc;
use tracing::{info, warn};

use flotilla_hypervisor::bus::LocalBus;
use flotilla_hypervisor::config::Config;
use flotilla_hypervisor::driver::{VirshDriver, VirtDriver};
use flotilla_hypervisor::runtime::HypervisorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla_hypervisor=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        hypervisor = %config.hypervisor_name,
        domain = %config.routing_domain,
        control_addr = %config.control_addr,
        data_dir = %config.data_dir.display(),
        libvirt_uri = %config.libvirt_uri,
        "Starting Flotilla Hypervisor"
    );

    let driver = Arc::new(VirshDriver::new(config.libvirt_uri.clone()));
    info!(driver_type = driver.driver_type(), "Driver initialized");

    let control_addr = config.control_addr;
    let runtime = HypervisorRuntime::builder()
        .config(config)
        .driver(driver)
        .bus(Arc::new(LocalBus::new()))
        .build()?
        .start()
        .await?;

    info!(addr = %control_addr, "Hypervisor ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Flotilla Hypervisor shut down");

    Ok(())
}
