// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain descriptor metadata.
//!
//! Every domain defined by a worker carries its owner in the descriptor:
//! `<uuid>` is the VM identity, `<name>` the display name, and
//! `<description>` holds `address::::credential`. This is what lets a node
//! adopt a domain that arrives through live migration.
//!
//! Descriptors are read with `roxmltree` and edited by splicing byte ranges,
//! so everything outside the touched elements is preserved verbatim.

use std::ops::Range;

use roxmltree::{Document, Node};

use crate::error::{Error, Result};

/// Separator between address and credential inside `<description>`.
pub const SEPARATOR: &str = "::::";

/// Ownership metadata embedded in a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMetadata {
    /// Bare address of the owning VM.
    pub address: String,
    /// Credential of the owning VM.
    pub credential: String,
    /// Display name.
    pub name: String,
}

impl DomainMetadata {
    /// Extract ownership metadata.
    ///
    /// Returns `Ok(None)` for a well-formed descriptor that carries no
    /// metadata (a domain not managed by flotilla).
    pub fn parse(xml: &str) -> Result<Option<Self>> {
        let doc = parse_domain(xml)?;
        let root = doc.root_element();

        let Some(description) = child_text(root, "description") else {
            return Ok(None);
        };
        let Some((address, credential)) = description.split_once(SEPARATOR) else {
            return Ok(None);
        };
        let (address, credential) = (address.trim(), credential.trim());
        if address.is_empty() || credential.is_empty() {
            return Ok(None);
        }

        let name = child_text(root, "name").unwrap_or_default();
        Ok(Some(Self {
            address: address.to_string(),
            credential: credential.to_string(),
            name,
        }))
    }

    /// Identity (node part of the address).
    pub fn identity(&self) -> &str {
        self.address
            .split_once('@')
            .map(|(node, _)| node)
            .unwrap_or(&self.address)
    }
}

/// Embed identity, name and ownership metadata into a descriptor.
pub fn prepare_definition(
    xml: &str,
    identity: &str,
    name: &str,
    address: &str,
    credential: &str,
) -> Result<String> {
    let xml = set_element_text(xml, "uuid", identity)?;
    let xml = set_element_text(&xml, "name", name)?;
    set_element_text(&xml, "description", &format!("{address}{SEPARATOR}{credential}"))
}

/// Rewrite a source VM's descriptor for its clone.
///
/// Folder paths are moved to the clone's folder, MAC addresses are dropped so
/// the virtualization layer assigns fresh ones, and the ownership metadata is
/// replaced.
pub fn rewrite_for_clone(
    xml: &str,
    identity: &str,
    name: &str,
    address: &str,
    credential: &str,
    source_folder: &str,
    target_folder: &str,
) -> Result<String> {
    let moved = if source_folder.is_empty() {
        xml.to_string()
    } else {
        xml.replace(source_folder, target_folder)
    };
    let stripped = remove_elements(&moved, "mac")?;
    prepare_definition(&stripped, identity, name, address, credential)
}

/// Set the text of the first `<tag>` child of the root element.
///
/// The element is created before the root's closing tag when missing.
pub fn set_element_text(xml: &str, tag: &str, value: &str) -> Result<String> {
    let doc = parse_domain(xml)?;
    let root = doc.root_element();
    let replacement = format!("<{tag}>{}</{tag}>", escape(value));

    let range: Range<usize> = match root.children().find(|n| n.has_tag_name(tag)) {
        Some(node) => node.range(),
        None => {
            let end = root.range().end;
            let close = xml[..end].rfind("</").ok_or_else(|| {
                Error::InvalidMetadata("root element has no closing tag".to_string())
            })?;
            close..close
        }
    };

    let mut out = String::with_capacity(xml.len() + replacement.len());
    out.push_str(&xml[..range.start]);
    out.push_str(&replacement);
    out.push_str(&xml[range.end..]);
    Ok(out)
}

fn remove_elements(xml: &str, tag: &str) -> Result<String> {
    let doc = parse_domain(xml)?;
    let mut ranges: Vec<Range<usize>> = doc
        .descendants()
        .filter(|n| n.has_tag_name(tag))
        .map(|n| n.range())
        .collect();
    ranges.sort_by_key(|r| std::cmp::Reverse(r.start));

    let mut out = xml.to_string();
    for range in ranges {
        out.replace_range(range, "");
    }
    Ok(out)
}

fn parse_domain(xml: &str) -> Result<Document<'_>> {
    let doc = Document::parse(xml)
        .map_err(|e| Error::InvalidMetadata(format!("malformed descriptor: {e}")))?;
    if !doc.root_element().has_tag_name("domain") {
        return Err(Error::InvalidMetadata(format!(
            "root element is <{}>, expected <domain>",
            doc.root_element().tag_name().name()
        )));
    }
    Ok(doc)
}

fn child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
