// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messaging substrate contract.
//!
//! The hypervisor and every VM worker own an account on a federated message
//! bus. Requests are [`Stanza`]s carrying an action and named attributes;
//! replies reuse the request id and carry either a result payload or an
//! error. Accounts are created on first connection (in-band registration)
//! and keep a contact list.

pub mod local;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::address::EntityAddress;

pub use local::LocalBus;

/// Errors from bus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The account exists with a different credential.
    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),

    /// No account with this address.
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// The recipient has no live connection.
    #[error("Recipient not connected: {0}")]
    NotConnected(String),

    /// No reply arrived in time.
    #[error("Request {id} timed out after {timeout:?}")]
    Timeout {
        /// Request id.
        id: String,
        /// How long we waited.
        timeout: Duration,
    },

    /// A request with the same id is already waiting for its reply.
    #[error("Request {0} is already pending")]
    DuplicateRequest(String),

    /// The bus dropped the request.
    #[error("Request {0} was dropped")]
    Dropped(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Payload of a stanza.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StanzaBody {
    /// A command.
    Request {
        /// Action token.
        action: String,
        /// Named attributes.
        #[serde(default)]
        attributes: BTreeMap<String, String>,
    },
    /// Successful reply.
    Result {
        /// Reply payload.
        payload: Value,
    },
    /// Failed reply.
    Error {
        /// Numeric code (driver code or action code).
        code: i32,
        /// Machine-readable error kind.
        kind: String,
        /// Human-readable message.
        message: String,
    },
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stanza {
    /// Correlation id, shared by a request and its reply.
    pub id: String,
    /// Sender address.
    pub from: String,
    /// Recipient address.
    pub to: String,
    /// Payload.
    #[serde(flatten)]
    pub body: StanzaBody,
}

impl Stanza {
    /// A new request with a random id.
    pub fn request(
        from: impl Into<String>,
        to: impl Into<String>,
        action: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            body: StanzaBody::Request {
                action: action.into(),
                attributes,
            },
        }
    }

    /// Successful reply to this stanza.
    pub fn reply_result(&self, payload: Value) -> Self {
        self.reply(StanzaBody::Result { payload })
    }

    /// Error reply to this stanza.
    pub fn reply_error(&self, code: i32, kind: &str, message: impl Into<String>) -> Self {
        self.reply(StanzaBody::Error {
            code,
            kind: kind.to_string(),
            message: message.into(),
        })
    }

    /// Whether this stanza is a reply.
    pub fn is_reply(&self) -> bool {
        !matches!(self.body, StanzaBody::Request { .. })
    }

    fn reply(&self, body: StanzaBody) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            body,
        }
    }
}

/// A live connection to the bus.
#[derive(Debug)]
pub struct Session {
    /// Full address of this connection.
    pub address: EntityAddress,
    /// Stanzas addressed to this account.
    pub inbox: mpsc::Receiver<Stanza>,
}

/// Messaging substrate.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Authenticate as `address`, registering the account on first use.
    async fn connect(&self, address: &EntityAddress, credential: &str) -> Result<Session>;

    /// Route a stanza to its recipient.
    ///
    /// Replies to a pending [`request`](Self::request) complete that request
    /// instead of being routed.
    async fn send(&self, stanza: Stanza) -> Result<()>;

    /// Send a request and wait for its reply.
    async fn request(&self, stanza: Stanza, timeout: Duration) -> Result<Stanza>;

    /// Add `contact` to the contact list of `owner`.
    async fn add_contact(&self, owner: &str, contact: &str) -> Result<()>;

    /// Close the live connection of `address` without touching its account.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Remove the account of `address` and its contact list.
    async fn unregister(&self, address: &str) -> Result<()>;
}
