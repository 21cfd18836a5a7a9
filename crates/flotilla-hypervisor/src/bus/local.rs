// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process message bus.
//!
//! Used by the standalone binary (the control listener is the only external
//! entry point) and by tests. Accounts, contact lists and pending requests
//! live behind one mutex; delivery happens outside it.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};

use super::*;
use crate::address::bare_of;

const INBOX_CAPACITY: usize = 64;

#[derive(Debug)]
struct Account {
    credential: String,
    contacts: BTreeSet<String>,
    session: Option<mpsc::Sender<Stanza>>,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<String, Account>,
    pending: HashMap<String, oneshot::Sender<Stanza>>,
}

/// Message bus living inside the current process.
#[derive(Debug, Default)]
pub struct LocalBus {
    state: Mutex<State>,
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an account exists for `address`.
    pub async fn has_account(&self, address: &str) -> bool {
        self.state
            .lock()
            .await
            .accounts
            .contains_key(&bare_of(address))
    }

    /// Whether `address` currently has a live connection.
    pub async fn is_connected(&self, address: &str) -> bool {
        self.state
            .lock()
            .await
            .accounts
            .get(&bare_of(address))
            .is_some_and(|a| a.session.as_ref().is_some_and(|s| !s.is_closed()))
    }

    /// Contact list of `address`.
    pub async fn contacts(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .accounts
            .get(&bare_of(address))
            .map(|a| a.contacts.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn connect(&self, address: &EntityAddress, credential: &str) -> Result<Session> {
        let bare = address.bare();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut state = self.state.lock().await;
        match state.accounts.get_mut(&bare) {
            Some(account) if account.credential != credential => {
                return Err(BusError::AuthenticationFailed(bare));
            }
            Some(account) => account.session = Some(tx),
            None => {
                info!(address = %bare, "Registered new bus account");
                state.accounts.insert(
                    bare.clone(),
                    Account {
                        credential: credential.to_string(),
                        contacts: BTreeSet::new(),
                        session: Some(tx),
                    },
                );
            }
        }
        debug!(address = %address, "Bus session opened");
        Ok(Session {
            address: address.clone(),
            inbox: rx,
        })
    }

    async fn send(&self, stanza: Stanza) -> Result<()> {
        let target = {
            let mut state = self.state.lock().await;
            if stanza.is_reply()
                && let Some(waiter) = state.pending.remove(&stanza.id)
            {
                let _ = waiter.send(stanza);
                return Ok(());
            }
            let bare = bare_of(&stanza.to);
            let account = state
                .accounts
                .get(&bare)
                .ok_or_else(|| BusError::UnknownAccount(bare.clone()))?;
            account
                .session
                .clone()
                .ok_or_else(|| BusError::NotConnected(bare.clone()))?
        };
        let to = stanza.to.clone();
        target
            .send(stanza)
            .await
            .map_err(|_| BusError::NotConnected(to))
    }

    async fn request(&self, stanza: Stanza, timeout: Duration) -> Result<Stanza> {
        let id = stanza.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.pending.contains_key(&id) {
                return Err(BusError::DuplicateRequest(id));
            }
            state.pending.insert(id.clone(), tx);
        }

        if let Err(e) = self.send(stanza).await {
            self.state.lock().await.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Dropped(id)),
            Err(_) => {
                self.state.lock().await.pending.remove(&id);
                Err(BusError::Timeout { id, timeout })
            }
        }
    }

    async fn add_contact(&self, owner: &str, contact: &str) -> Result<()> {
        let owner = bare_of(owner);
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&owner)
            .ok_or_else(|| BusError::UnknownAccount(owner.clone()))?;
        account.contacts.insert(bare_of(contact));
        info!(owner = %owner, contact = %contact, "Contact added");
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let bare = bare_of(address);
        if let Some(account) = self.state.lock().await.accounts.get_mut(&bare) {
            account.session = None;
        }
        debug!(address = %bare, "Bus session closed");
        Ok(())
    }

    async fn unregister(&self, address: &str) -> Result<()> {
        let bare = bare_of(address);
        self.state
            .lock()
            .await
            .accounts
            .remove(&bare)
            .ok_or_else(|| BusError::UnknownAccount(bare.clone()))?;
        info!(address = %bare, "Bus account removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(raw: &str) -> EntityAddress {
        EntityAddress::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_connect_registers_and_checks_credential() {
        let bus = LocalBus::new();
        bus.connect(&addr("vm1@localhost/hv"), "secret").await.unwrap();
        assert!(bus.has_account("vm1@localhost").await);

        let err = bus
            .connect(&addr("vm1@localhost/hv"), "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = std::sync::Arc::new(LocalBus::new());
        let mut session = bus.connect(&addr("vm1@localhost/hv"), "pw").await.unwrap();

        let responder = bus.clone();
        tokio::spawn(async move {
            if let Some(request) = session.inbox.recv().await {
                responder
                    .send(request.reply_result(json!({"ok": true})))
                    .await
                    .unwrap();
            }
        });

        let request = Stanza::request("ops@localhost", "vm1@localhost", "info", Default::default());
        let reply = bus.request(request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            reply.body,
            StanzaBody::Result {
                payload: json!({"ok": true})
            }
        );
        assert_eq!(reply.to, "ops@localhost");
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_is_refused() {
        let bus = std::sync::Arc::new(LocalBus::new());
        let _session = bus.connect(&addr("vm1@localhost/hv"), "pw").await.unwrap();

        let first = Stanza::request("ops@localhost", "vm1@localhost", "info", Default::default());
        let second = first.clone();
        let waiting = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request(first, Duration::from_millis(200)).await })
        };
        tokio::task::yield_now().await;
        while !bus.state.lock().await.pending.contains_key(&second.id) {
            tokio::task::yield_now().await;
        }

        let err = bus
            .request(second, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateRequest(_)));
        // The first request still owns its slot and times out on its own.
        assert!(matches!(
            waiting.await.unwrap(),
            Err(BusError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_to_disconnected_account() {
        let bus = LocalBus::new();
        bus.connect(&addr("vm1@localhost/hv"), "pw").await.unwrap();
        bus.disconnect("vm1@localhost").await.unwrap();
        let stanza = Stanza::request("a@localhost", "vm1@localhost", "info", Default::default());
        assert!(matches!(
            bus.send(stanza).await,
            Err(BusError::NotConnected(_))
        ));
        assert!(bus.has_account("vm1@localhost").await);
    }

    #[tokio::test]
    async fn test_contacts_and_unregister() {
        let bus = LocalBus::new();
        bus.connect(&addr("vm1@localhost/hv"), "pw").await.unwrap();
        bus.add_contact("vm1@localhost", "ops@example.com/laptop")
            .await
            .unwrap();
        assert_eq!(bus.contacts("vm1@localhost").await, vec!["ops@example.com"]);

        bus.unregister("vm1@localhost").await.unwrap();
        assert!(!bus.has_account("vm1@localhost").await);
        assert!(bus.unregister("vm1@localhost").await.is_err());
    }
}
