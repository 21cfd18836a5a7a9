// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flotilla-hypervisor integration tests.
//!
//! Provides TestHypervisor: a hypervisor over a temp data dir, the mock
//! driver and the in-process bus.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flotilla_hypervisor::bus::LocalBus;
use flotilla_hypervisor::config::Config;
use flotilla_hypervisor::driver::MockDriver;
use flotilla_hypervisor::hooks::{self, HookPoint};
use flotilla_hypervisor::{Hypervisor, VmWorker};

/// Root admin configured on every test hypervisor.
pub const ADMIN: &str = "admin@localhost";

/// Minimal domain descriptor; identity and metadata are filled in on define.
pub const DOMAIN_XML: &str =
    "<domain type='kvm'><name>placeholder</name><memory unit='MiB'>512</memory></domain>";

/// Hypervisor wired to a mock driver and an in-process bus.
pub struct TestHypervisor {
    pub hypervisor: Arc<Hypervisor>,
    pub driver: Arc<MockDriver>,
    pub bus: Arc<LocalBus>,
    pub config: Config,
    _temp_dir: tempfile::TempDir,
}

impl TestHypervisor {
    /// Create a hypervisor with the default test configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a hypervisor after adjusting the test configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mut config = test_config(temp_dir.path());
        adjust(&mut config);

        let driver = Arc::new(MockDriver::new());
        let bus = Arc::new(LocalBus::new());
        let hypervisor = Hypervisor::open(config.clone(), driver.clone(), bus.clone())
            .await
            .expect("Failed to open hypervisor");

        Self {
            hypervisor,
            driver,
            bus,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Simulate a restart: disconnect every worker and open a new hypervisor
    /// over the same stores, driver and bus.
    pub async fn reopen(&mut self) {
        self.hypervisor.shutdown_workers().await;
        self.hypervisor = Hypervisor::open(
            self.config.clone(),
            self.driver.clone(),
            self.bus.clone(),
        )
        .await
        .expect("Failed to reopen hypervisor");
    }

    /// Allocate a VM with a defined domain, optionally running.
    ///
    /// The domain is defined before the worker starts so the worker loads it
    /// on initialization.
    pub async fn alloc_defined(&self, name: &str, running: bool) -> Arc<VmWorker> {
        let worker = self
            .hypervisor
            .alloc(None, Some(name), false)
            .await
            .expect("alloc failed");
        worker
            .define_domain(DOMAIN_XML)
            .await
            .expect("define failed");
        if running {
            worker.start_domain().await.expect("start failed");
        }
        worker.start();
        worker
    }

    /// Count how often a hypervisor hook point fires from now on.
    pub fn count_hook(&self, point: HookPoint) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        self.hypervisor
            .hooks()
            .register(
                point,
                hooks::callback(move |_| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                None,
                false,
            )
            .expect("Failed to register hook");
        counter
    }
}

/// Test configuration rooted at `data_dir`.
pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::with_data_dir(data_dir);
    config.hypervisor_name = "hv1".to_string();
    config.root_admins = vec![ADMIN.to_string()];
    config.credential_length = 16;
    config
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
