// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Production driver backed by the `virsh` command line client.
//!
//! Every operation runs `virsh -c <uri> ...` through `tokio::process`.
//! Lifecycle events come from a long-running
//! `virsh event --all --loop --event lifecycle` whose output lines look like:
//!
//! ```text
//! event 'lifecycle' for domain 'web': Stopped Migrated
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::*;

/// virsh prints no numeric codes, so every other failure is reported as
/// libvirt's `VIR_ERR_INTERNAL_ERROR`.
const VIR_ERR_INTERNAL_ERROR: i32 = 1;

/// Driver shelling out to `virsh`.
#[derive(Debug, Clone)]
pub struct VirshDriver {
    uri: String,
    binary: String,
}

impl VirshDriver {
    /// Driver for the virtualization layer at `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            binary: std::env::var("FLOTILLA_VIRSH_BINARY").unwrap_or_else(|_| "virsh".to_string()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c").arg(&self.uri).kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_input(args, None).await
    }

    async fn run_with_input(&self, args: &[&str], input: Option<&str>) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(uri = %self.uri, args = ?args, "Running virsh");
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(parse_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl VirtDriver for VirshDriver {
    fn driver_type(&self) -> &'static str {
        "virsh"
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn capabilities(&self) -> Result<String> {
        self.run(&["capabilities"]).await
    }

    async fn lookup(&self, domain: &str) -> Result<Option<DomainState>> {
        match self.run(&["domstate", domain]).await {
            Ok(out) => Ok(Some(parse_state(&out))),
            Err(DriverError::DomainNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn define(&self, xml: &str) -> Result<()> {
        self.run_with_input(&["define", "/dev/stdin"], Some(xml))
            .await
            .map(|_| ())
    }

    async fn start(&self, domain: &str) -> Result<()> {
        self.run(&["start", domain]).await.map(|_| ())
    }

    async fn shutdown(&self, domain: &str) -> Result<()> {
        self.run(&["shutdown", domain]).await.map(|_| ())
    }

    async fn destroy(&self, domain: &str) -> Result<()> {
        self.run(&["destroy", domain]).await.map(|_| ())
    }

    async fn undefine(&self, domain: &str) -> Result<()> {
        self.run(&["undefine", domain]).await.map(|_| ())
    }

    async fn xml_desc(&self, domain: &str) -> Result<String> {
        self.run(&["dumpxml", domain]).await
    }

    async fn migrate(&self, domain: &str, destination_uri: &str) -> Result<()> {
        self.run(&[
            "migrate",
            "--live",
            "--persistent",
            "--undefinesource",
            domain,
            destination_uri,
        ])
        .await
        .map(|_| ())
    }

    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<DomainEvent>> {
        let mut child = self
            .command()
            .args(["event", "--all", "--loop", "--event", "lifecycle"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DriverError::EventsUnsupported(format!("cannot run virsh event: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::EventsUnsupported("virsh event has no stdout".into()))?;

        let (tx, rx) = mpsc::channel(256);
        let uri = self.uri.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_event_line(&line)
                                && tx.send(event).await.is_err()
                            {
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!(uri = %uri, "virsh event stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!(uri = %uri, error = %e, "Failed to read virsh event stream");
                            break;
                        }
                    },
                }
            }
            let _ = child.kill().await;
        });

        info!(uri = %self.uri, "Subscribed to lifecycle events");
        Ok(rx)
    }
}

fn parse_state(out: &str) -> DomainState {
    match out.lines().next().unwrap_or("").trim() {
        "running" => DomainState::Running,
        "idle" | "blocked" => DomainState::Blocked,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::Shutdown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::PmSuspended,
        _ => DomainState::NoState,
    }
}

fn parse_error(stderr: &str) -> DriverError {
    let message = stderr
        .lines()
        .map(|l| l.trim_start_matches("error:").trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(": ");

    if message.contains("failed to get domain") || message.contains("Domain not found") {
        return DriverError::DomainNotFound(message);
    }
    DriverError::Virt {
        code: VIR_ERR_INTERNAL_ERROR,
        message,
    }
}

fn parse_event_line(line: &str) -> Option<DomainEvent> {
    let rest = line.trim().strip_prefix("event 'lifecycle' for domain ")?;
    let rest = rest.strip_prefix('\'')?;
    let (domain, rest) = rest.rsplit_once("': ")?;
    let mut words = rest.split_whitespace();
    let kind = words.next()?;
    let detail = words.next().unwrap_or("");

    let event = match kind {
        "Defined" => LifecycleEvent::Defined,
        "Undefined" => LifecycleEvent::Undefined,
        "Started" => LifecycleEvent::Started,
        "Suspended" => LifecycleEvent::Suspended,
        "Resumed" => LifecycleEvent::Resumed(match detail {
            "Migrated" => ResumedReason::Migrated,
            "Snapshot" => ResumedReason::FromSnapshot,
            _ => ResumedReason::Unpaused,
        }),
        "Stopped" => LifecycleEvent::Stopped(match detail {
            "Destroyed" => StoppedReason::Destroyed,
            "Crashed" => StoppedReason::Crashed,
            "Migrated" => StoppedReason::Migrated,
            "Saved" => StoppedReason::Saved,
            "Failed" => StoppedReason::Failed,
            "Snapshot" => StoppedReason::FromSnapshot,
            _ => StoppedReason::Shutdown,
        }),
        "Shutdown" => LifecycleEvent::Shutdown,
        "Crashed" => LifecycleEvent::Crashed,
        "PMSuspended" => LifecycleEvent::PmSuspended,
        _ => return None,
    };

    Some(DomainEvent {
        domain: domain.to_string(),
        xml: None,
        event,
    })
}
