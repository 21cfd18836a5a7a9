// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded SQLite schemas.
//!
//! The hypervisor keeps two kinds of database:
//! - the VM registry (one per hypervisor)
//! - permission grant stores (one for the hypervisor, one per VM folder)
//!
//! Both are opened through [`open_sqlite`], which creates the file and its
//! parent directory when missing and then applies the matching migrator.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::Result;

/// Schema of the VM registry store.
pub static REGISTRY: Migrator = sqlx::migrate!("./migrations/registry");

/// Schema of a permission grant store.
pub static PERMISSIONS: Migrator = sqlx::migrate!("./migrations/permissions");

/// Open (creating if absent) the SQLite database at `path` and run `migrator`.
pub async fn open_sqlite(path: &Path, migrator: &Migrator) -> Result<SqlitePool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    migrator.run(&pool).await?;

    Ok(pool)
}
