// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routable entity addresses of the form `node@domain/resource`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Address of an entity on the messaging substrate.
///
/// The bare form (`node@domain`) identifies an account; the resource, when
/// present, identifies one connection of that account. VM addresses use the
/// VM identity as node and the hypervisor name as resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityAddress {
    /// Account name (VM identity or hypervisor name).
    pub node: String,
    /// Routing domain.
    pub domain: String,
    /// Optional connection resource.
    pub resource: Option<String>,
}

impl EntityAddress {
    /// Build an address from its parts. Node and domain are lowercased.
    pub fn new(node: &str, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.to_lowercase(),
            domain: domain.to_lowercase(),
            resource: resource.map(str::to_string),
        }
    }

    /// Parse `node@domain[/resource]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (bare, resource) = match raw.split_once('/') {
            Some((bare, resource)) if !resource.is_empty() => (bare, Some(resource)),
            Some((bare, _)) => (bare, None),
            None => (raw, None),
        };
        let (node, domain) = bare
            .split_once('@')
            .ok_or_else(|| Error::InvalidRequest(format!("address {raw:?} has no domain")))?;
        if node.is_empty() || domain.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "address {raw:?} has an empty node or domain"
            )));
        }
        Ok(Self::new(node, domain, resource))
    }

    /// `node@domain`, without the resource.
    pub fn bare(&self) -> String {
        format!("{}@{}", self.node, self.domain)
    }

    /// Same address without the resource part.
    pub fn to_bare(&self) -> Self {
        Self {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}@{}/{}", self.node, self.domain, resource),
            None => write!(f, "{}@{}", self.node, self.domain),
        }
    }
}

/// Bare form of `raw` when it parses as an address, `raw` unchanged otherwise.
pub fn bare_of(raw: &str) -> String {
    EntityAddress::parse(raw)
        .map(|a| a.bare())
        .unwrap_or_else(|_| raw.trim().to_string())
}
