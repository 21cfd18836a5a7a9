// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the command dispatcher.

mod common;

use common::*;
use flotilla_hypervisor::dispatcher::{
    CommandDispatcher, ControlRequest, NS_HYPERVISOR_ERROR, NS_LIBVIRT_ERROR, Outcome,
    TEXT_ACTION,
};
use serde_json::Value;

fn request(from: &str, action: &str, attributes: &[(&str, &str)]) -> ControlRequest {
    ControlRequest {
        id: uuid::Uuid::new_v4().to_string(),
        from: from.to_string(),
        to: None,
        action: action.to_string(),
        attributes: attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn payload(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Result { payload } => payload,
        other => panic!("expected a result, got {other:?}"),
    }
}

fn error(outcome: Outcome) -> (i32, String, String) {
    match outcome {
        Outcome::Error {
            code,
            kind,
            namespace,
            ..
        } => (code, kind, namespace),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_action() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let req = request("mallory@localhost", "reboot", &[]);
    let id = req.id.clone();
    let response = dispatcher.dispatch(req).await;

    assert_eq!(response.id, id);
    assert_eq!(
        response.outcome,
        Outcome::NoSuchAction {
            action: "reboot".to_string()
        }
    );
    assert!(!dispatcher.knows("reboot"));
    assert!(dispatcher.knows("alloc"));
}

#[tokio::test]
async fn test_permission_denied() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let response = dispatcher
        .dispatch(request("mallory@localhost", "alloc", &[("name", "web")]))
        .await;

    let (code, kind, namespace) = error(response.outcome);
    assert_eq!(code, -1);
    assert_eq!(kind, "PERMISSION_DENIED");
    assert_eq!(namespace, NS_HYPERVISOR_ERROR);
    assert_eq!(th.hypervisor.vm_count().await, 0);
}

#[tokio::test]
async fn test_admin_alloc_and_roster() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let allocated = payload(
        dispatcher
            .dispatch(request(ADMIN, "alloc", &[("name", "web")]))
            .await
            .outcome,
    );
    assert_eq!(allocated["name"], "web");
    let address = allocated["address"].as_str().unwrap().to_string();

    let roster = payload(dispatcher.dispatch(request(ADMIN, "roster", &[])).await.outcome);
    let entries = roster.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["address"], address.as_str());
    assert_eq!(entries[0]["name"], "web");

    // The admin requested the VM and holds every permission on it.
    let worker = th.hypervisor.get_vm_by_name("web").await.unwrap();
    assert_eq!(
        worker.permissions().grants_of(ADMIN).await.unwrap(),
        vec!["all".to_string()]
    );
}

#[tokio::test]
async fn test_granted_caller() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    let carol = "carol@localhost/desk";

    let denied = dispatcher.dispatch(request(carol, "ip", &[])).await;
    assert_eq!(error(denied.outcome).0, -1);

    th.hypervisor
        .permissions()
        .grant("carol@localhost", "ip")
        .await
        .unwrap();
    let ip = payload(dispatcher.dispatch(request(carol, "ip", &[])).await.outcome);
    assert_eq!(ip["ip"], "127.0.0.1");

    let still_denied = dispatcher.dispatch(request(carol, "alloc", &[])).await;
    assert_eq!(error(still_denied.outcome).1, "PERMISSION_DENIED");

    th.hypervisor
        .permissions()
        .grant("carol@localhost", "all")
        .await
        .unwrap();
    let allocated = payload(dispatcher.dispatch(request(carol, "alloc", &[])).await.outcome);
    assert!(!allocated["name"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_libvirt_uri_needs_no_permission() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let uri = payload(
        dispatcher
            .dispatch(request("peer@elsewhere", "libvirt-uri", &[]))
            .await
            .outcome,
    );
    assert_eq!(uri["uri"], "qemu://127.0.0.1/system");
}

#[tokio::test]
async fn test_capabilities() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let caps = payload(
        dispatcher
            .dispatch(request(ADMIN, "capabilities", &[]))
            .await
            .outcome,
    );
    assert!(caps["capabilities"].as_str().unwrap().contains("x86_64"));
}

#[tokio::test]
async fn test_free_by_name() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    let worker = th.alloc_defined("web", true).await;

    let freed = payload(
        dispatcher
            .dispatch(request(ADMIN, "free", &[("identifier", "WEB")]))
            .await
            .outcome,
    );
    assert_eq!(freed["identity"], worker.instance().identity.as_str());
    assert_eq!(th.hypervisor.vm_count().await, 0);
    assert_eq!(th.driver.domain_count().await, 0);
}

#[tokio::test]
async fn test_error_codes() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let missing = dispatcher
        .dispatch(request(ADMIN, "free", &[("identifier", "ghost")]))
        .await;
    assert_eq!(
        error(missing.outcome),
        (-9002, "NOT_FOUND".to_string(), NS_HYPERVISOR_ERROR.to_string())
    );

    let no_identifier = dispatcher.dispatch(request(ADMIN, "free", &[])).await;
    assert_eq!(error(no_identifier.outcome).1, "INVALID_REQUEST");

    dispatcher
        .dispatch(request(ADMIN, "alloc", &[("name", "web")]))
        .await;
    let conflict = dispatcher
        .dispatch(request(ADMIN, "alloc", &[("name", "Web")]))
        .await;
    assert_eq!(error(conflict.outcome).0, -9001);

    let incomplete = dispatcher
        .dispatch(request(
            ADMIN,
            "alloc_for_migration",
            &[("address", "x@localhost")],
        ))
        .await;
    assert_eq!(
        error(incomplete.outcome),
        (
            -9007,
            "INVALID_REQUEST".to_string(),
            NS_HYPERVISOR_ERROR.to_string()
        )
    );

    let clone_undefined = dispatcher
        .dispatch(request(ADMIN, "clone", &[("identifier", "web")]))
        .await;
    assert_eq!(error(clone_undefined.outcome).0, -9004);
}

#[tokio::test]
async fn test_virtualization_code_is_preserved() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    th.alloc_defined("web", true).await;

    th.driver.inject_failure("destroy", 55).await;
    let response = dispatcher
        .dispatch(request(ADMIN, "free", &[("identifier", "web")]))
        .await;

    assert_eq!(
        error(response.outcome),
        (
            55,
            "VIRTUALIZATION_ERROR".to_string(),
            NS_LIBVIRT_ERROR.to_string()
        )
    );
    assert_eq!(th.hypervisor.vm_count().await, 1);
}

#[tokio::test]
async fn test_migration_actions() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    let identity = "5e1f0a3b-aaaa-4bbb-8ccc-dddddddddddd";
    let address = format!("{identity}@localhost");

    let registered = payload(
        dispatcher
            .dispatch(request(
                ADMIN,
                "alloc_for_migration",
                &[
                    ("address", address.as_str()),
                    ("name", "traveler"),
                    ("credential", "s3cret"),
                ],
            ))
            .await
            .outcome,
    );
    assert_eq!(registered["address"], address.as_str());
    assert!(th.hypervisor.get_vm_by_uuid(identity).await.is_some());

    let released = payload(
        dispatcher
            .dispatch(request(
                ADMIN,
                "free_for_migration",
                &[("identifier", identity)],
            ))
            .await
            .outcome,
    );
    assert_eq!(released["address"], address.as_str());
    assert_eq!(th.hypervisor.vm_count().await, 0);

    let denied = dispatcher
        .dispatch(request(
            "stranger@localhost",
            "free_for_migration",
            &[("identifier", identity)],
        ))
        .await;
    assert_eq!(error(denied.outcome).0, -1);
}

async fn say(dispatcher: &CommandDispatcher, from: &str, line: &str) -> String {
    let response = dispatcher
        .dispatch(request(from, TEXT_ACTION, &[("body", line)]))
        .await;
    payload(response.outcome)["body"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_text_roster_aliases() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    let worker = th.hypervisor.alloc(None, Some("web"), false).await.unwrap();
    let line = format!(" - web ({})", worker.instance().address.bare());

    for alias in ["roster", "vms", "virtual machines", "Domains"] {
        let reply = say(&dispatcher, ADMIN, alias).await;
        assert!(reply.starts_with("Here is the content of my roster:"), "{alias}: {reply}");
        assert!(reply.contains(&line), "{alias}: {reply}");
    }
    assert!(dispatcher.knows(TEXT_ACTION));
}

#[tokio::test]
async fn test_text_alloc_and_free() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    let reply = say(&dispatcher, ADMIN, "alloc my web").await;
    assert!(reply.contains("with name my web has been allocated"), "{reply}");
    let worker = th.hypervisor.get_vm_by_name("my web").await.unwrap();
    let address = worker.instance().address.bare();
    drop(worker);

    let generated = say(&dispatcher, ADMIN, "alloc").await;
    assert!(generated.contains("has been allocated"), "{generated}");
    assert_eq!(th.hypervisor.vm_count().await, 2);

    assert_eq!(
        say(&dispatcher, ADMIN, "free").await,
        "I'm sorry, you use a wrong format. You can type 'help' to get help"
    );
    assert!(say(&dispatcher, ADMIN, "free ghost").await.contains("doesn't exist"));

    let freed = say(&dispatcher, ADMIN, "FREE My Web").await;
    assert_eq!(freed, format!("Virtual machine {address} has been freed."));
    assert_eq!(th.hypervisor.vm_count().await, 1);
}

#[tokio::test]
async fn test_text_clone() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    let source = th.alloc_defined("src", false).await;
    let address = source.instance().address.bare();

    let reply = say(&dispatcher, ADMIN, "clone src").await;
    assert_eq!(reply, format!("Cloning of virtual machine {address} has started."));
    assert_eq!(th.hypervisor.vm_count().await, 2);

    // The source has to be defined.
    th.hypervisor.alloc(None, Some("bare"), false).await.unwrap();
    assert!(say(&dispatcher, ADMIN, "clone bare").await.starts_with("Error: "));
}

#[tokio::test]
async fn test_text_info_commands() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());

    assert_eq!(say(&dispatcher, ADMIN, "ip").await, "Sure, my IP is 127.0.0.1");
    assert_eq!(
        say(&dispatcher, ADMIN, "Libvirt URI").await,
        "Sure, my libvirt URI is qemu://127.0.0.1/system"
    );
    assert!(say(&dispatcher, ADMIN, "capabilities").await.contains("x86_64"));

    let help = say(&dispatcher, "anyone@localhost", "help").await;
    assert!(help.contains("roster, vms, virtual machines, domains"));
    assert!(help.contains("free <identifier>"));

    let unknown = say(&dispatcher, ADMIN, "reboot everything").await;
    assert!(unknown.starts_with("I don't understand"), "{unknown}");
}

#[tokio::test]
async fn test_text_commands_are_permission_gated() {
    let th = TestHypervisor::new().await;
    let dispatcher = CommandDispatcher::new(th.hypervisor.clone());
    let dave = "dave@localhost/desk";

    let denied = say(&dispatcher, dave, "alloc web").await;
    assert!(denied.contains("permission \"alloc\""), "{denied}");
    assert_eq!(th.hypervisor.vm_count().await, 0);
    assert!(say(&dispatcher, dave, "libvirt uri").await.contains("permission \"uri\""));

    th.hypervisor
        .permissions()
        .grant("dave@localhost", "rostervm")
        .await
        .unwrap();
    assert!(say(&dispatcher, dave, "vms").await.starts_with("Here is the content"));
    assert!(say(&dispatcher, dave, "ip").await.starts_with("Sorry"));
}
