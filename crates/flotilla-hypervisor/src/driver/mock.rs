// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock driver for testing.
//!
//! An in-memory virtualization layer. Domains are keyed by the `<uuid>` of
//! their descriptor, state transitions emit lifecycle events to the
//! subscriber, and failures can be injected per operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roxmltree::Document;
use tokio::sync::{Mutex, mpsc};

use super::traits::*;

/// Mock domain state.
#[derive(Debug, Clone)]
struct MockDomain {
    name: String,
    xml: String,
    state: DomainState,
}

/// Mock driver for testing.
pub struct MockDriver {
    uri: String,
    domains: Arc<Mutex<HashMap<String, MockDomain>>>,
    subscriber: Mutex<Option<mpsc::Sender<DomainEvent>>>,
    failures: Mutex<HashMap<&'static str, i32>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    supports_events: bool,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a mock driver that delivers lifecycle events.
    pub fn new() -> Self {
        Self {
            uri: "test:///default".to_string(),
            domains: Arc::new(Mutex::new(HashMap::new())),
            subscriber: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            supports_events: true,
        }
    }

    /// Create a mock driver whose event subscription fails.
    pub fn without_events() -> Self {
        Self {
            supports_events: false,
            ..Self::new()
        }
    }

    /// Make the next call to `operation` fail with `code`.
    ///
    /// `operation` is the trait method name (`"define"`, `"destroy"`, ...).
    pub async fn inject_failure(&self, operation: &'static str, code: i32) {
        self.failures.lock().await.insert(operation, code);
    }

    /// Make the next call to `operation` wait `delay` before running.
    pub async fn inject_delay(&self, operation: &'static str, delay: Duration) {
        self.delays.lock().await.insert(operation, delay);
    }

    /// Deliver an arbitrary event to the subscriber.
    ///
    /// Events are dropped when nobody subscribed or the subscriber lags by
    /// more than the channel capacity.
    pub async fn emit(&self, event: DomainEvent) {
        if let Some(sender) = self.subscriber.lock().await.as_ref() {
            let _ = sender.try_send(event);
        }
    }

    /// Insert a domain directly, without emitting an event.
    pub async fn insert_domain(&self, xml: &str, state: DomainState) -> Result<String> {
        let (uuid, name) = parse_identity(xml)?;
        self.domains.lock().await.insert(
            uuid.clone(),
            MockDomain {
                name,
                xml: xml.to_string(),
                state,
            },
        );
        Ok(uuid)
    }

    /// Force the state of a domain.
    pub async fn set_state(&self, domain: &str, state: DomainState) -> Result<()> {
        let mut domains = self.domains.lock().await;
        let entry = find_mut(&mut domains, domain)?;
        entry.state = state;
        Ok(())
    }

    /// State of a domain, if defined.
    pub async fn state_of(&self, domain: &str) -> Option<DomainState> {
        let domains = self.domains.lock().await;
        find(&domains, domain).map(|d| d.state)
    }

    /// Number of defined domains.
    pub async fn domain_count(&self) -> usize {
        self.domains.lock().await.len()
    }

    async fn check_failure(&self, operation: &'static str) -> Result<()> {
        let delay = self.delays.lock().await.remove(operation);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.lock().await.remove(operation) {
            Some(code) => Err(DriverError::Virt {
                code,
                message: format!("injected {operation} failure"),
            }),
            None => Ok(()),
        }
    }

    async fn transition(
        &self,
        domain: &str,
        state: DomainState,
        event: LifecycleEvent,
    ) -> Result<()> {
        let uuid = {
            let mut domains = self.domains.lock().await;
            let entry = find_mut(&mut domains, domain)?;
            entry.state = state;
            uuid_of(&domains, domain).unwrap_or_else(|| domain.to_string())
        };
        self.emit(DomainEvent {
            domain: uuid,
            xml: None,
            event,
        })
        .await;
        Ok(())
    }
}

fn find<'a>(domains: &'a HashMap<String, MockDomain>, key: &str) -> Option<&'a MockDomain> {
    domains
        .get(key)
        .or_else(|| domains.values().find(|d| d.name == key))
}

fn find_mut<'a>(
    domains: &'a mut HashMap<String, MockDomain>,
    key: &str,
) -> Result<&'a mut MockDomain> {
    let uuid = uuid_of(domains, key).ok_or_else(|| DriverError::DomainNotFound(key.to_string()))?;
    domains
        .get_mut(&uuid)
        .ok_or_else(|| DriverError::DomainNotFound(key.to_string()))
}

fn uuid_of(domains: &HashMap<String, MockDomain>, key: &str) -> Option<String> {
    if domains.contains_key(key) {
        return Some(key.to_string());
    }
    domains
        .iter()
        .find(|(_, d)| d.name == key)
        .map(|(uuid, _)| uuid.clone())
}

fn parse_identity(xml: &str) -> Result<(String, String)> {
    let doc = Document::parse(xml).map_err(|e| DriverError::Virt {
        code: 27,
        message: format!("XML error: {e}"),
    })?;
    let text = |tag: &str| {
        doc.root_element()
            .children()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    };
    let uuid = text("uuid").ok_or_else(|| DriverError::Virt {
        code: 27,
        message: "XML error: missing <uuid>".to_string(),
    })?;
    let name = text("name").unwrap_or_else(|| uuid.clone());
    Ok((uuid, name))
}

#[async_trait]
impl VirtDriver for MockDriver {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn capabilities(&self) -> Result<String> {
        self.check_failure("capabilities").await?;
        Ok("<capabilities><host><cpu><arch>x86_64</arch></cpu></host></capabilities>".to_string())
    }

    async fn lookup(&self, domain: &str) -> Result<Option<DomainState>> {
        self.check_failure("lookup").await?;
        Ok(self.state_of(domain).await)
    }

    async fn define(&self, xml: &str) -> Result<()> {
        self.check_failure("define").await?;
        let (uuid, name) = parse_identity(xml)?;
        {
            let mut domains = self.domains.lock().await;
            let state = domains
                .get(&uuid)
                .map(|d| d.state)
                .unwrap_or(DomainState::Shutoff);
            domains.insert(
                uuid.clone(),
                MockDomain {
                    name,
                    xml: xml.to_string(),
                    state,
                },
            );
        }
        self.emit(DomainEvent {
            domain: uuid,
            xml: Some(xml.to_string()),
            event: LifecycleEvent::Defined,
        })
        .await;
        Ok(())
    }

    async fn start(&self, domain: &str) -> Result<()> {
        self.check_failure("start").await?;
        self.transition(domain, DomainState::Running, LifecycleEvent::Started)
            .await
    }

    async fn shutdown(&self, domain: &str) -> Result<()> {
        self.check_failure("shutdown").await?;
        self.transition(
            domain,
            DomainState::Shutoff,
            LifecycleEvent::Stopped(StoppedReason::Shutdown),
        )
        .await
    }

    async fn destroy(&self, domain: &str) -> Result<()> {
        self.check_failure("destroy").await?;
        self.transition(
            domain,
            DomainState::Shutoff,
            LifecycleEvent::Stopped(StoppedReason::Destroyed),
        )
        .await
    }

    async fn undefine(&self, domain: &str) -> Result<()> {
        self.check_failure("undefine").await?;
        let uuid = {
            let mut domains = self.domains.lock().await;
            let uuid = uuid_of(&domains, domain)
                .ok_or_else(|| DriverError::DomainNotFound(domain.to_string()))?;
            domains.remove(&uuid);
            uuid
        };
        self.emit(DomainEvent {
            domain: uuid,
            xml: None,
            event: LifecycleEvent::Undefined,
        })
        .await;
        Ok(())
    }

    async fn xml_desc(&self, domain: &str) -> Result<String> {
        self.check_failure("xml_desc").await?;
        let domains = self.domains.lock().await;
        find(&domains, domain)
            .map(|d| d.xml.clone())
            .ok_or_else(|| DriverError::DomainNotFound(domain.to_string()))
    }

    async fn migrate(&self, domain: &str, _destination_uri: &str) -> Result<()> {
        self.check_failure("migrate").await?;
        let (uuid, xml) = {
            let mut domains = self.domains.lock().await;
            let uuid = uuid_of(&domains, domain)
                .ok_or_else(|| DriverError::DomainNotFound(domain.to_string()))?;
            let state = domains.get(&uuid).map(|d| d.state);
            if state != Some(DomainState::Running) {
                return Err(DriverError::Virt {
                    code: 55,
                    message: format!("Requested operation is not valid: domain {domain} is not running"),
                });
            }
            let removed = domains.remove(&uuid).map(|d| d.xml);
            (uuid, removed)
        };
        self.emit(DomainEvent {
            domain: uuid,
            xml,
            event: LifecycleEvent::Stopped(StoppedReason::Migrated),
        })
        .await;
        Ok(())
    }

    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<DomainEvent>> {
        if !self.supports_events {
            return Err(DriverError::EventsUnsupported(
                "mock driver built without events".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(256);
        *self.subscriber.lock().await = Some(tx);
        Ok(rx)
    }
}
