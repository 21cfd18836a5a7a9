// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM Registry Store.
//!
//! Durable table of the VMs registered on this hypervisor, one row per VM
//! keyed by its bare address. The hypervisor replays every row at startup and
//! is the only writer.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::error::Result;
use crate::migrations;

/// One persisted VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct VmRecord {
    /// Bare address (`identity@domain`).
    pub address: String,
    /// Credential the worker authenticates with.
    #[serde(skip)]
    pub credential: String,
    /// When the VM was first allocated.
    pub created_at: DateTime<Utc>,
    /// Free-text annotation.
    pub annotation: String,
    /// Display name.
    pub display_name: String,
}

/// SQLite-backed registry of VMs.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
}

impl RegistryStore {
    /// Open (creating if absent) the registry at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let pool = migrations::open_sqlite(path.as_ref(), &migrations::REGISTRY).await?;
        Ok(Self { pool })
    }

    /// Insert a row.
    pub async fn insert(&self, record: &VmRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO virtual_machines (address, credential, created_at, annotation, display_name)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&record.address)
        .bind(&record.credential)
        .bind(record.created_at)
        .bind(&record.annotation)
        .bind(&record.display_name)
        .execute(&self.pool)
        .await?;
        debug!(address = %record.address, "Registry row inserted");
        Ok(())
    }

    /// Delete the row for `address`. Returns whether a row existed.
    pub async fn delete(&self, address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM virtual_machines WHERE address = ?1")
            .bind(address)
            .execute(&self.pool)
            .await?;
        debug!(address = %address, removed = result.rows_affected(), "Registry row deleted");
        Ok(result.rows_affected() > 0)
    }

    /// Whether a row exists for `address`.
    pub async fn contains(&self, address: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM virtual_machines WHERE address = ?1")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Every row, oldest first.
    pub async fn list_all(&self) -> Result<Vec<VmRecord>> {
        let records = sqlx::query_as::<_, VmRecord>(
            r#"
            SELECT address, credential, created_at, annotation, display_name
            FROM virtual_machines
            ORDER BY created_at, address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
