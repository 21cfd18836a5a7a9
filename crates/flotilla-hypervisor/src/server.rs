// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control listener.
//!
//! A TCP listener speaking line-delimited JSON: each line is a
//! [`ControlRequest`], each answer a [`ControlResponse`] on its own line.
//! Requests without `to`, or addressed to the hypervisor, go to the
//! [`CommandDispatcher`]; requests addressed to a VM are relayed over the bus
//! to that VM's worker and its reply is returned.
//!
//! The caller identity is the `from` field asserted on each line; every
//! permission check trusts it. Bind the listener only to a trusted interface
//! (loopback or a management network), never to a public one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::address::bare_of;
use crate::bus::{Stanza, StanzaBody};
use crate::dispatcher::{CommandDispatcher, ControlRequest, ControlResponse, Outcome};

/// Error namespace for failures reported by a VM worker.
pub const NS_VM_ERROR: &str = "flotilla:vm:error";

/// How long a relayed request waits for the VM's reply.
const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve control connections on `listener` until `shutdown` flips to true.
pub async fn run_control_server(
    listener: TcpListener,
    dispatcher: Arc<CommandDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Control listener started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Control listener shutting down");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(remote = %remote, "Control connection accepted");
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher).await {
                            warn!(remote = %remote, error = %e, "Control connection error");
                        }
                    });
                }
                Err(e) => error!("Failed to accept control connection: {}", e),
            },
        }
    }

    Ok(())
}

/// Serve one connection: one request per line, one response per line.
pub async fn handle_connection(stream: TcpStream, dispatcher: Arc<CommandDispatcher>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handle_request(&dispatcher, request).await,
            Err(e) => ControlResponse {
                id: String::new(),
                outcome: Outcome::Error {
                    code: -1,
                    kind: "INVALID_REQUEST".to_string(),
                    namespace: crate::dispatcher::NS_HYPERVISOR_ERROR.to_string(),
                    message: format!("malformed request: {e}"),
                },
            },
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }

    debug!("Control connection closed");
    Ok(())
}

/// Route one request to the dispatcher or to a VM.
pub async fn handle_request(
    dispatcher: &CommandDispatcher,
    request: ControlRequest,
) -> ControlResponse {
    let hypervisor = dispatcher.hypervisor();
    let own_address = hypervisor.address().bare();

    let target = match request.to.as_deref().map(bare_of) {
        None => return dispatcher.dispatch(request).await,
        Some(target) if target == own_address => return dispatcher.dispatch(request).await,
        Some(target) => target,
    };

    // Client ids are only unique per client; the bus correlates on its own.
    let stanza = Stanza {
        id: uuid::Uuid::new_v4().to_string(),
        from: request.from,
        to: target.clone(),
        body: StanzaBody::Request {
            action: request.action,
            attributes: request.attributes,
        },
    };

    let outcome = match hypervisor.bus().request(stanza, RELAY_TIMEOUT).await {
        Ok(reply) => match reply.body {
            StanzaBody::Result { payload } => Outcome::Result { payload },
            StanzaBody::Error {
                code,
                kind,
                message,
            } => Outcome::Error {
                code,
                kind,
                namespace: NS_VM_ERROR.to_string(),
                message,
            },
            StanzaBody::Request { .. } => Outcome::Error {
                code: -1,
                kind: "INTERNAL_ERROR".to_string(),
                namespace: NS_VM_ERROR.to_string(),
                message: "virtual machine answered with a request".to_string(),
            },
        },
        Err(e) => {
            warn!(target = %target, error = %e, "Failed to relay request to virtual machine");
            Outcome::Error {
                code: -1,
                kind: "BUS_ERROR".to_string(),
                namespace: NS_VM_ERROR.to_string(),
                message: e.to_string(),
            }
        }
    };

    ControlResponse {
        id: request.id,
        outcome,
    }
}
