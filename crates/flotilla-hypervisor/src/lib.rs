// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flotilla Hypervisor - VM registry and lifecycle agent
//!
//! The hypervisor agent runs on one virtualization host. It keeps a durable
//! registry of the virtual machines it manages, runs one worker per VM on the
//! message bus, gates remote commands with per-entity permissions, and keeps
//! the registry consistent with live migrations observed through the
//! virtualization layer's lifecycle events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Control clients / peer hypervisors            │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │ JSON lines
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      flotilla-hypervisor                         │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────────┐    │
//! │  │  Control   │──►│  Command     │──►│     Hypervisor       │    │
//! │  │  listener  │   │  dispatcher  │   │  registry + store    │    │
//! │  └────────────┘   └──────────────┘   └──────────────────────┘    │
//! │        │ relay                               │ spawn             │
//! │        ▼                                     ▼                   │
//! │  ┌────────────┐                      ┌──────────────────────┐    │
//! │  │ Message bus│◄────────────────────►│  VM workers (1/VM)   │    │
//! │  └────────────┘                      └──────────────────────┘    │
//! │                                              │                   │
//! │  ┌──────────────────────┐  lifecycle events  │ define/start/...  │
//! │  │ Migration listener   │◄───────────────────┤                   │
//! │  └──────────────────────┘                    ▼                   │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//!                     ┌───────────────────────┐
//!                     │ Virtualization driver │
//!                     │  (virsh / mock)       │
//!                     └───────────────────────┘
//! ```
//!
//! # Durable state
//!
//! | Store | Location | Content |
//! |-------|----------|---------|
//! | Registry | `FLOTILLA_REGISTRY_DATABASE` | one row per managed VM |
//! | Hypervisor grants | `FLOTILLA_PERMISSIONS_DATABASE` | who may alloc, free, clone ... |
//! | VM grants | `<vm folder>/permissions.sqlite3` | who may drive each VM |
//!
//! On start, every registry row is replayed into a running worker.
//!
//! # Embedding
//!
//! Use [`runtime::HypervisorRuntime`] to run the agent inside another tokio
//! application, or [`hypervisor::Hypervisor`] directly for finer control.

#![deny(missing_docs)]

/// Entity addresses (`node@domain/resource`).
pub mod address;

/// Message bus abstraction and the in-process implementation.
pub mod bus;

/// Configuration loaded from environment variables.
pub mod config;

/// Permission-gated dispatch of hypervisor actions.
pub mod dispatcher;

/// Virtualization drivers.
pub mod driver;

/// Error types.
pub mod error;

/// Named hook points with persistent and one-shot callbacks.
pub mod hooks;

/// The orchestrator: registry, lifecycle operations, lookups.
pub mod hypervisor;

/// Ownership metadata embedded in domain descriptors.
pub mod metadata;

/// Registry reconciliation from live-migration events.
pub mod migration;

/// Embedded SQLite migrations.
pub mod migrations;

/// Display name generation.
pub mod names;

/// Per-entity permission store.
pub mod permissions;

/// Durable registry of managed VMs.
pub mod registry_store;

/// Embeddable runtime.
pub mod runtime;

/// JSON-lines control listener.
pub mod server;

/// Per-VM worker.
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use hypervisor::Hypervisor;
pub use runtime::HypervisorRuntime;
pub use worker::{MigrationState, VirtualMachine, VmWorker};
