// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the flotilla hypervisor agent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Hypervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node part of the hypervisor's own address.
    pub hypervisor_name: String,
    /// Routing domain used for the hypervisor and every VM address.
    pub routing_domain: String,
    /// Root directory for databases and VM folders
    pub data_dir: PathBuf,
    /// SQLite file holding the VM registry
    pub registry_database: PathBuf,
    /// SQLite file holding the hypervisor's permission grants
    pub permissions_database: PathBuf,
    /// Parent directory of the per-VM folders
    pub vm_dir: PathBuf,
    /// Optional dictionary used for generated VM names (one name per line)
    pub names_file: Option<PathBuf>,
    /// Length of generated VM credentials
    pub credential_length: usize,
    /// When false, blank spaces in requested VM names are replaced with `-`
    pub allow_blank_space_in_vm_name: bool,
    /// Identities that pass every permission check
    pub root_admins: Vec<String>,
    /// URI of the local virtualization layer
    pub libvirt_uri: String,
    /// Explicit URI peers should use to migrate domains to this node
    pub migration_uri: Option<String>,
    /// IP address advertised by the `ip` action and used to derive the migration URI
    pub ip: String,
    /// Bind address of the JSON control listener. Callers are identified by
    /// the address they assert, so this must be a trusted interface.
    pub control_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hypervisor_name = std::env::var("FLOTILLA_HYPERVISOR_NAME")
            .ok()
            .or_else(local_hostname)
            .unwrap_or_else(|| "hypervisor".to_string());

        let routing_domain =
            std::env::var("FLOTILLA_ROUTING_DOMAIN").unwrap_or_else(|_| "localhost".to_string());

        let data_dir = PathBuf::from(
            std::env::var("FLOTILLA_DATA_DIR").unwrap_or_else(|_| ".data".to_string()),
        );

        let mut config = Self::with_data_dir(&data_dir);
        config.hypervisor_name = hypervisor_name;
        config.routing_domain = routing_domain;

        if let Ok(path) = std::env::var("FLOTILLA_REGISTRY_DATABASE") {
            config.registry_database = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("FLOTILLA_PERMISSIONS_DATABASE") {
            config.permissions_database = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("FLOTILLA_VM_DIR") {
            config.vm_dir = PathBuf::from(path);
        }
        config.names_file = std::env::var("FLOTILLA_NAMES_FILE").ok().map(PathBuf::from);

        if let Ok(raw) = std::env::var("FLOTILLA_CREDENTIAL_LENGTH") {
            let length: usize = raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("FLOTILLA_CREDENTIAL_LENGTH", raw))?;
            if length == 0 {
                return Err(ConfigError::InvalidNumber(
                    "FLOTILLA_CREDENTIAL_LENGTH",
                    "0".to_string(),
                ));
            }
            config.credential_length = length;
        }

        if let Ok(raw) = std::env::var("FLOTILLA_ALLOW_BLANK_SPACE_IN_VM_NAME") {
            config.allow_blank_space_in_vm_name =
                parse_bool(&raw).ok_or(ConfigError::InvalidBool(
                    "FLOTILLA_ALLOW_BLANK_SPACE_IN_VM_NAME",
                    raw,
                ))?;
        }

        config.root_admins = std::env::var("FLOTILLA_ROOT_ADMINS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        if let Ok(uri) = std::env::var("FLOTILLA_LIBVIRT_URI") {
            config.libvirt_uri = uri;
        }
        config.migration_uri = std::env::var("FLOTILLA_MIGRATION_URI")
            .ok()
            .filter(|v| !v.is_empty());

        config.ip = std::env::var("FLOTILLA_IP")
            .ok()
            .or_else(get_host_ip)
            .unwrap_or_else(|| "127.0.0.1".to_string());

        config.control_addr = control_addr(
            std::env::var("FLOTILLA_CONTROL_HOST").ok().as_deref(),
            std::env::var("FLOTILLA_CONTROL_PORT").ok().as_deref(),
        )?;

        Ok(config)
    }

    /// Build a configuration with every default rooted at `data_dir`.
    ///
    /// Useful when embedding the hypervisor or in tests, where reading the
    /// process environment is undesirable.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            hypervisor_name: "hypervisor".to_string(),
            routing_domain: "localhost".to_string(),
            registry_database: data_dir.join("hypervisor.sqlite3"),
            permissions_database: data_dir.join("permissions.sqlite3"),
            vm_dir: data_dir.join("vms"),
            data_dir,
            names_file: None,
            credential_length: 32,
            allow_blank_space_in_vm_name: true,
            root_admins: Vec::new(),
            libvirt_uri: "qemu:///system".to_string(),
            migration_uri: None,
            ip: "127.0.0.1".to_string(),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric variable could not be parsed or is out of range.
    #[error("Invalid number for {0}: {1:?}")]
    InvalidNumber(&'static str, String),
    /// A boolean variable was not one of true/false/1/0/yes/no.
    #[error("Invalid boolean for {0}: {1:?}")]
    InvalidBool(&'static str, String),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// The control host is not an IP address.
    #[error("Invalid control host: {0:?}")]
    InvalidHost(String),
}

/// Control listener address; loopback unless a host is given.
fn control_addr(host: Option<&str>, port: Option<&str>) -> Result<SocketAddr, ConfigError> {
    let ip = match host {
        Some(raw) => raw
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(raw.to_string()))?,
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    let port = match port {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
        None => 9090,
    };
    Ok(SocketAddr::new(ip, port))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Source IP of the default route, as reported by `ip route show default`.
fn get_host_ip() -> Option<String> {
    let output = std::process::Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_route_source(&String::from_utf8_lossy(&output.stdout))
}

// Format: "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.95 ..."
fn parse_route_source(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "src" {
                return parts.next().map(str::to_string);
            }
        }
        None
    })
}
