// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Permission Center.
//!
//! Maps `(user, permission)` to granted/denied. Permissions are declared once
//! with a default value; grants are stored per user and are individually
//! revocable. Root admins pass every check, and holding the `all` permission
//! is equivalent to holding every other one.

use std::path::Path;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::address::bare_of;
use crate::error::{Error, Result};
use crate::migrations;

/// Permission implying every other permission.
pub const ALL: &str = "all";

/// Durable permission store for one entity (the hypervisor or a VM).
#[derive(Debug, Clone)]
pub struct PermissionCenter {
    pool: SqlitePool,
    admins: Vec<String>,
}

impl PermissionCenter {
    /// Open (creating if absent) the grant store at `path`.
    ///
    /// `admins` are bare or full addresses that bypass every check.
    pub async fn open(path: impl AsRef<Path>, admins: &[String]) -> Result<Self> {
        let pool = migrations::open_sqlite(path.as_ref(), &migrations::PERMISSIONS).await?;
        let center = Self {
            pool,
            admins: admins.iter().map(|a| bare_of(a)).collect(),
        };
        center
            .create_permission(ALL, "All permissions are granted", false)
            .await?;
        Ok(center)
    }

    /// Declare a permission. Existing declarations are left untouched.
    pub async fn create_permission(
        &self,
        name: &str,
        description: &str,
        default_granted: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO permissions (name, description, default_value) VALUES (?1, ?2, ?3)",
        )
        .bind(name)
        .bind(description)
        .bind(default_granted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Names of every declared permission.
    pub async fn permissions(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM permissions ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("name")).collect())
    }

    /// Grant `permission` to `user`.
    pub async fn grant(&self, user: &str, permission: &str) -> Result<()> {
        if !self.exists(permission).await? {
            return Err(Error::InvalidRequest(format!(
                "permission {permission:?} does not exist"
            )));
        }
        let user = bare_of(user);
        sqlx::query(
            "INSERT OR IGNORE INTO grants (user_id, permission, granted_at) VALUES (?1, ?2, ?3)",
        )
        .bind(&user)
        .bind(permission)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        info!(user = %user, permission = %permission, "Permission granted");
        Ok(())
    }

    /// Revoke `permission` from `user`. Returns whether a grant was removed.
    pub async fn revoke(&self, user: &str, permission: &str) -> Result<bool> {
        let user = bare_of(user);
        let result = sqlx::query("DELETE FROM grants WHERE user_id = ?1 AND permission = ?2")
            .bind(&user)
            .bind(permission)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(user = %user, permission = %permission, "Permission revoked");
        }
        Ok(removed)
    }

    /// Permissions explicitly granted to `user`.
    pub async fn grants_of(&self, user: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT permission FROM grants WHERE user_id = ?1 ORDER BY permission")
                .bind(bare_of(user))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("permission"))
            .collect())
    }

    /// Whether `user` is a root admin.
    pub fn is_admin(&self, user: &str) -> bool {
        let user = bare_of(user);
        self.admins.iter().any(|a| *a == user)
    }

    /// Whether `user` may use `permission`.
    pub async fn check(&self, user: &str, permission: &str) -> Result<bool> {
        if self.is_admin(user) {
            return Ok(true);
        }

        let user = bare_of(user);
        let granted: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM grants WHERE user_id = ?1 AND (permission = ?2 OR permission = ?3) LIMIT 1",
        )
        .bind(&user)
        .bind(permission)
        .bind(ALL)
        .fetch_optional(&self.pool)
        .await?;
        if granted.is_some() {
            return Ok(true);
        }

        let default: Option<bool> =
            sqlx::query_scalar("SELECT default_value FROM permissions WHERE name = ?1")
                .bind(permission)
                .fetch_optional(&self.pool)
                .await?;
        let allowed = default.unwrap_or(false);
        debug!(user = %user, permission = %permission, allowed, "Permission checked");
        Ok(allowed)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn exists(&self, permission: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM permissions WHERE name = ?1")
            .bind(permission)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}
