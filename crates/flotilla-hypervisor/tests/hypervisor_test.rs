// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the hypervisor orchestrator.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use flotilla_hypervisor::Error;
use flotilla_hypervisor::bus::MessageBus;
use flotilla_hypervisor::driver::DomainState;
use flotilla_hypervisor::hooks::HookPoint;
use flotilla_hypervisor::worker::MigrationState;

#[tokio::test]
async fn test_alloc_registers_and_persists() {
    let th = TestHypervisor::new().await;
    let allocs = th.count_hook(HookPoint::HypervisorAlloc);

    let worker = th.hypervisor.alloc(None, Some("web"), true).await.unwrap();
    let vm = worker.instance();

    assert_eq!(vm.name, "web");
    assert_eq!(vm.address.bare(), format!("{}@localhost", vm.identity));
    assert_eq!(vm.address.resource.as_deref(), Some("hv1"));
    assert_eq!(vm.credential.len(), 16);
    assert!(vm.folder.join("permissions.sqlite3").exists());

    assert_eq!(th.hypervisor.vm_count().await, 1);
    assert!(
        th.hypervisor
            .registry_store()
            .contains(&vm.address.bare())
            .await
            .unwrap()
    );
    assert_eq!(allocs.load(Ordering::SeqCst), 1);

    let bare = vm.address.bare();
    assert!(wait_for(|| th.bus.is_connected(&bare)).await);
    assert!(worker.is_started());
}

#[tokio::test]
async fn test_alloc_generates_name() {
    let th = TestHypervisor::new().await;
    let worker = th.hypervisor.alloc(None, None, false).await.unwrap();
    assert!(!worker.instance().name.is_empty());
    assert!(!worker.is_started());
}

#[tokio::test]
async fn test_alloc_name_conflict_is_case_insensitive() {
    let th = TestHypervisor::new().await;
    th.hypervisor.alloc(None, Some("Web"), false).await.unwrap();

    let err = th
        .hypervisor
        .alloc(None, Some("web"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameConflict(ref name) if name == "web"));
    assert_eq!(err.error_code(), "NAME_CONFLICT");

    assert_eq!(th.hypervisor.vm_count().await, 1);
    assert_eq!(
        th.hypervisor.registry_store().list_all().await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_alloc_replaces_spaces_when_disallowed() {
    let th = TestHypervisor::with_config(|c| c.allow_blank_space_in_vm_name = false).await;
    let worker = th
        .hypervisor
        .alloc(None, Some("build box"), false)
        .await
        .unwrap();
    assert_eq!(worker.instance().name, "build-box");

    // The replaced name is the one checked for conflicts.
    let err = th
        .hypervisor
        .alloc(None, Some("build-box"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameConflict(_)));
}

#[tokio::test]
async fn test_alloc_keeps_spaces_when_allowed() {
    let th = TestHypervisor::new().await;
    let worker = th
        .hypervisor
        .alloc(None, Some("build box"), false)
        .await
        .unwrap();
    assert_eq!(worker.instance().name, "build box");
}

#[tokio::test]
async fn test_requester_gets_grant_and_contact() {
    let th = TestHypervisor::new().await;
    let worker = th
        .hypervisor
        .alloc(Some("alice@localhost/laptop"), Some("web"), true)
        .await
        .unwrap();

    let permissions = worker.permissions();
    assert!(permissions.check("alice@localhost", "destroy").await.unwrap());
    assert!(!permissions.check("bob@localhost", "destroy").await.unwrap());
    assert_eq!(
        permissions.grants_of("alice@localhost").await.unwrap(),
        vec!["all".to_string()]
    );

    let bare = worker.instance().address.bare();
    assert!(
        wait_for(|| async {
            th.bus
                .contacts(&bare)
                .await
                .contains(&"alice@localhost".to_string())
        })
        .await
    );
    assert_eq!(worker.hooks().registered(HookPoint::EntityAuthenticated), 0);
}

#[tokio::test]
async fn test_free_tears_down_domain() {
    let th = TestHypervisor::new().await;
    let frees = th.count_hook(HookPoint::HypervisorFree);
    let worker = th.alloc_defined("web", true).await;
    let vm = worker.instance().clone();
    assert!(wait_for(|| async { th.bus.is_connected(&vm.address.bare()).await }).await);
    assert_eq!(
        th.driver.state_of(&vm.identity).await,
        Some(DomainState::Running)
    );

    th.hypervisor.free(&vm.identity).await.unwrap();

    assert_eq!(th.driver.domain_count().await, 0);
    assert_eq!(th.hypervisor.vm_count().await, 0);
    assert!(th.hypervisor.get_vm_by_uuid(&vm.identity).await.is_none());
    assert!(
        !th.hypervisor
            .registry_store()
            .contains(&vm.address.bare())
            .await
            .unwrap()
    );
    assert!(!vm.folder.exists());
    assert!(!th.bus.has_account(&vm.address.bare()).await);
    assert_eq!(frees.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_free_without_domain() {
    let th = TestHypervisor::new().await;
    let worker = th.hypervisor.alloc(None, Some("empty"), true).await.unwrap();
    let identity = worker.instance().identity.clone();

    th.hypervisor.free(&identity).await.unwrap();
    assert_eq!(th.hypervisor.vm_count().await, 0);
}

#[tokio::test]
async fn test_free_unknown_vm() {
    let th = TestHypervisor::new().await;
    let err = th.hypervisor.free("no-such-vm").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_free_refused_while_migrating() {
    let th = TestHypervisor::new().await;
    let worker = th.alloc_defined("web", true).await;
    let identity = worker.instance().identity.clone();

    // No event listener runs here, so the VM stays MigratingOut.
    worker.migrate("qemu+tcp://10.0.0.2/system").await.unwrap();
    assert_eq!(worker.migration_state(), MigrationState::MigratingOut);

    let err = th.hypervisor.free(&identity).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InUse {
            state: MigrationState::MigratingOut,
            ..
        }
    ));
    assert_eq!(th.hypervisor.vm_count().await, 1);
}

#[tokio::test]
async fn test_failed_teardown_keeps_vm_registered() {
    let th = TestHypervisor::new().await;
    let worker = th.alloc_defined("web", true).await;
    let identity = worker.instance().identity.clone();

    th.driver.inject_failure("destroy", 55).await;
    let err = th.hypervisor.free(&identity).await.unwrap_err();
    assert!(matches!(err, Error::Virtualization(ref e) if e.code() == 55));

    assert!(th.hypervisor.get_vm_by_uuid(&identity).await.is_some());
    assert_eq!(
        th.driver.state_of(&identity).await,
        Some(DomainState::Running)
    );
}

#[tokio::test]
async fn test_readers_not_blocked_during_free_teardown() {
    let th = TestHypervisor::new().await;
    let frees = th.count_hook(HookPoint::HypervisorFree);
    let worker = th.alloc_defined("web", true).await;
    let identity = worker.instance().identity.clone();
    drop(worker);

    th.driver
        .inject_delay("destroy", Duration::from_millis(500))
        .await;
    let freeing = {
        let hypervisor = th.hypervisor.clone();
        let identity = identity.clone();
        tokio::spawn(async move { hypervisor.free(&identity).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The VM stays listed while its domain is torn down.
    let roster = tokio::time::timeout(Duration::from_millis(200), th.hypervisor.roster())
        .await
        .expect("roster blocked by a running free");
    assert_eq!(roster.len(), 1);

    let err = th.hypervisor.free(&identity).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    freeing.await.unwrap().unwrap();
    assert_eq!(th.hypervisor.vm_count().await, 0);
    assert_eq!(frees.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_free_then_alloc_same_name_gets_new_identity() {
    let th = TestHypervisor::new().await;
    let first = th.alloc_defined("db", false).await;
    let first_identity = first.instance().identity.clone();

    th.hypervisor.free(&first_identity).await.unwrap();
    let second = th.hypervisor.alloc(None, Some("db"), true).await.unwrap();

    assert_eq!(second.instance().name, "db");
    assert_ne!(second.instance().identity, first_identity);
    assert_eq!(th.hypervisor.roster().await.len(), 1);
}

#[tokio::test]
async fn test_clone_requires_definition() {
    let th = TestHypervisor::new().await;
    let source = th.hypervisor.alloc(None, Some("src"), false).await.unwrap();

    let err = th
        .hypervisor
        .clone_vm(&source.instance().identity, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(th.hypervisor.vm_count().await, 1);
}

#[tokio::test]
async fn test_clone_requires_stopped_source() {
    let th = TestHypervisor::new().await;
    let source = th.alloc_defined("src", true).await;

    let err = th
        .hypervisor
        .clone_vm(&source.instance().identity, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(th.hypervisor.vm_count().await, 1);
}

#[tokio::test]
async fn test_clone_copies_artifacts_and_definition() {
    let th = TestHypervisor::new().await;
    let clones = th.count_hook(HookPoint::HypervisorClone);
    let source = th.alloc_defined("src", false).await;
    std::fs::write(source.instance().folder.join("disk.qcow2"), b"disk").unwrap();

    let clone = th
        .hypervisor
        .clone_vm(&source.instance().identity, Some(ADMIN), None)
        .await
        .unwrap();
    let vm = clone.instance().clone();

    assert_ne!(vm.identity, source.instance().identity);
    assert!(vm.name.ends_with(" (clone of src)"), "name was {}", vm.name);
    assert_eq!(clones.load(Ordering::SeqCst), 1);

    assert!(wait_for(|| async { clone.definition().is_some() }).await);
    let definition = clone.definition().unwrap();
    assert!(definition.contains(&format!("<uuid>{}</uuid>", vm.identity)));
    assert!(definition.contains(&vm.address.bare()));

    assert_eq!(th.driver.domain_count().await, 2);
    assert_eq!(
        th.driver.state_of(&vm.identity).await,
        Some(DomainState::Shutoff)
    );
    assert!(vm.folder.join("disk.qcow2").exists());
    assert_eq!(th.hypervisor.vm_count().await, 2);
}

#[tokio::test]
async fn test_clone_with_requested_name() {
    let th = TestHypervisor::new().await;
    let source = th.alloc_defined("src", false).await;

    let clone = th
        .hypervisor
        .clone_vm(&source.instance().identity, None, Some("copy"))
        .await
        .unwrap();
    assert_eq!(clone.instance().name, "copy");

    let err = th
        .hypervisor
        .clone_vm(&source.instance().identity, None, Some("COPY"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameConflict(_)));
}

#[tokio::test]
async fn test_lookups() {
    let th = TestHypervisor::new().await;
    let worker = th.hypervisor.alloc(None, Some("Web"), false).await.unwrap();
    let vm = worker.instance();

    assert!(th.hypervisor.get_vm_by_name("WEB").await.is_some());
    assert!(th.hypervisor.get_vm_by_uuid(&vm.identity).await.is_some());
    assert!(
        th.hypervisor
            .get_vm_by_identifier(&vm.address.to_string())
            .await
            .is_some()
    );
    assert!(th.hypervisor.get_vm_by_identifier("nope").await.is_none());

    let entries = th.hypervisor.roster_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "Web");
    assert_eq!(th.hypervisor.identities().await, vec![vm.identity.clone()]);
}

#[tokio::test]
async fn test_replay_after_restart() {
    let mut th = TestHypervisor::new().await;
    let a = th.hypervisor.alloc(None, Some("alpha"), true).await.unwrap();
    let b = th.hypervisor.alloc(None, Some("beta"), true).await.unwrap();
    let a_identity = a.instance().identity.clone();
    let b_bare = b.instance().address.bare();
    assert!(wait_for(|| th.bus.is_connected(&b_bare)).await);
    drop((a, b));

    th.reopen().await;

    assert_eq!(th.hypervisor.vm_count().await, 2);
    let alpha = th.hypervisor.get_vm_by_name("alpha").await.unwrap();
    assert_eq!(alpha.instance().identity, a_identity);
    assert!(alpha.is_started());
    assert!(wait_for(|| th.bus.is_connected(&b_bare)).await);
    assert_eq!(
        th.hypervisor.registry_store().list_all().await.unwrap().len(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocs_stay_consistent() {
    let th = TestHypervisor::new().await;

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let hypervisor = th.hypervisor.clone();
            tokio::spawn(async move { hypervisor.alloc(None, None, false).await })
        })
        .collect();

    let mut names = HashSet::new();
    let mut identities = HashSet::new();
    for task in tasks {
        let worker = task.await.unwrap().unwrap();
        names.insert(worker.instance().name.to_lowercase());
        identities.insert(worker.instance().identity.clone());
    }

    assert_eq!(names.len(), 50);
    assert_eq!(identities.len(), 50);
    assert_eq!(th.hypervisor.vm_count().await, 50);
    assert_eq!(
        th.hypervisor.registry_store().list_all().await.unwrap().len(),
        50
    );
}

#[tokio::test]
async fn test_migration_uri_and_capabilities() {
    let th = TestHypervisor::with_config(|c| c.ip = "10.1.2.3".to_string()).await;
    assert_eq!(th.hypervisor.migration_libvirt_uri(), "qemu://10.1.2.3/system");
    assert_eq!(th.hypervisor.ip(), "10.1.2.3");
    assert!(
        th.hypervisor
            .capabilities()
            .await
            .unwrap()
            .contains("x86_64")
    );

    let th = TestHypervisor::with_config(|c| {
        c.migration_uri = Some("qemu+tcp://peer.example/system".to_string())
    })
    .await;
    assert_eq!(
        th.hypervisor.migration_libvirt_uri(),
        "qemu+tcp://peer.example/system"
    );
}

#[tokio::test]
async fn test_shutdown_keeps_bus_accounts() {
    let th = TestHypervisor::new().await;
    let worker = th.hypervisor.alloc(None, Some("web"), true).await.unwrap();
    let bare = worker.instance().address.bare();
    assert!(wait_for(|| th.bus.is_connected(&bare)).await);

    th.hypervisor.shutdown_workers().await;

    assert!(th.bus.has_account(&bare).await);
    assert!(!th.bus.is_connected(&bare).await);
    assert!(th.bus.unregister(&bare).await.is_ok());
}
