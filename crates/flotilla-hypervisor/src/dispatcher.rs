// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Permission-gated command dispatcher.
//!
//! Inbound control requests name an action token. The token is matched
//! exactly against the table assembled by [`CommandDispatcher::new`]; an
//! unknown token yields [`Outcome::NoSuchAction`] without any permission
//! check. A known token is checked against the hypervisor's
//! [`PermissionCenter`](crate::permissions::PermissionCenter) before the
//! matching orchestrator method runs.
//!
//! | Action | Permission | Attributes | Error code |
//! |--------|------------|------------|------------|
//! | `alloc` | `alloc` | `name?` | -9001 |
//! | `free` | `free` | `identifier` | -9002 |
//! | `roster` | `rostervm` | | -9003 |
//! | `clone` | `clone` | `identifier`, `name?` | -9004 |
//! | `ip` | `ip` | | -9005 |
//! | `libvirt-uri` | none | | -9006 |
//! | `alloc_for_migration` | `migration` | `address`, `name`, `credential` | -9007 |
//! | `free_for_migration` | `migration` | `identifier` | -9008 |
//! | `capabilities` | `capabilities` | | -9009 |
//!
//! `libvirt-uri` is open to everyone: a peer hypervisor asks for it during
//! the migration handshake, before it holds any grant.
//!
//! # Text commands
//!
//! The `message` action carries a plain-text command line in its `body`
//! attribute, the way a person types into a chat window. The reply is always
//! a result whose payload is `{"body": "<human-readable text>"}`; refusals and
//! failures are reported in that text too.
//!
//! | Command | Permission | Argument |
//! |---------|------------|----------|
//! | `alloc` | `alloc` | `[name]` |
//! | `free` | `free` | `<identifier>` |
//! | `clone` | `clone` | `<identifier>` |
//! | `roster`, `vms`, `virtual machines`, `domains` | `rostervm` | |
//! | `ip` | `ip` | |
//! | `libvirt uri` | `uri` | |
//! | `capabilities` | `capabilities` | |
//! | `help` | none | |
//!
//! Tokens match case-insensitively at the start of the line; the longest
//! matching token wins and the rest of the line is the argument.
//!
//! Failures keep the driver's own code for virtualization errors and use the
//! action's code otherwise. A panicking action is caught here and reported as
//! an internal error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;

/// Error namespace for orchestrator failures.
pub const NS_HYPERVISOR_ERROR: &str = "flotilla:hypervisor:error";
/// Error namespace for failures reported by the virtualization layer.
pub const NS_LIBVIRT_ERROR: &str = "flotilla:libvirt:error";

/// Error code of a permission denial.
pub const PERMISSION_DENIED_CODE: i32 = -1;

/// Action carrying a plain-text command in its `body` attribute.
pub const TEXT_ACTION: &str = "message";

const WRONG_FORMAT: &str = "I'm sorry, you use a wrong format. You can type 'help' to get help";

/// An inbound control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Correlation id echoed in the response.
    pub id: String,
    /// Caller identity.
    pub from: String,
    /// Recipient; absent or the hypervisor's own address for hypervisor actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Action token.
    pub action: String,
    /// Named attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Result of a dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The action succeeded.
    Result {
        /// Action payload.
        payload: Value,
    },
    /// The action failed or was refused.
    Error {
        /// Numeric code.
        code: i32,
        /// Machine-readable error kind.
        kind: String,
        /// Error namespace.
        namespace: String,
        /// Human-readable message.
        message: String,
    },
    /// The action token is unknown.
    NoSuchAction {
        /// The unknown token.
        action: String,
    },
}

/// Response to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Id of the request.
    pub id: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Arguments handed to an action.
#[derive(Debug, Clone)]
struct ActionContext {
    caller: String,
    attributes: BTreeMap<String, String>,
}

impl ActionContext {
    fn required(&self, key: &str) -> Result<&str> {
        self.optional(key)
            .ok_or_else(|| Error::InvalidRequest(format!("missing attribute {key:?}")))
    }

    fn optional(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

type ActionHandler = fn(Arc<Hypervisor>, ActionContext) -> BoxFuture<'static, Result<Value>>;

type TextHandler =
    fn(Arc<Hypervisor>, String, Option<String>) -> BoxFuture<'static, Result<String>>;

struct TextCommand {
    tokens: &'static [&'static str],
    permission: Option<&'static str>,
    parameter: Option<&'static str>,
    description: &'static str,
    handler: TextHandler,
}

const TEXT_COMMANDS: &[TextCommand] = &[
    TextCommand {
        tokens: &["capabilities"],
        permission: Some("capabilities"),
        parameter: None,
        description: "Get my capabilities",
        handler: text_capabilities,
    },
    TextCommand {
        tokens: &["libvirt uri"],
        permission: Some("uri"),
        parameter: None,
        description: "Get my libvirt URI",
        handler: text_libvirt_uri,
    },
    TextCommand {
        tokens: &["ip"],
        permission: Some("ip"),
        parameter: None,
        description: "Get my IP address",
        handler: text_ip,
    },
    TextCommand {
        tokens: &["roster", "vms", "virtual machines", "domains"],
        permission: Some("rostervm"),
        parameter: None,
        description: "Get the content of my roster",
        handler: text_roster,
    },
    TextCommand {
        tokens: &["alloc"],
        permission: Some("alloc"),
        parameter: Some("[name]"),
        description: "Allocate a new virtual machine",
        handler: text_alloc,
    },
    TextCommand {
        tokens: &["free"],
        permission: Some("free"),
        parameter: Some("<identifier>"),
        description: "Free a virtual machine",
        handler: text_free,
    },
    TextCommand {
        tokens: &["clone"],
        permission: Some("clone"),
        parameter: Some("<identifier>"),
        description: "Clone a virtual machine",
        handler: text_clone,
    },
    TextCommand {
        tokens: &["help"],
        permission: None,
        parameter: None,
        description: "Show this list",
        handler: text_help,
    },
];

/// Find the command whose token is the longest prefix of `line`, and the
/// argument following it.
fn match_text_command(line: &str) -> Option<(&'static TextCommand, Option<String>)> {
    let line = line.trim();
    let mut best: Option<(&'static TextCommand, usize)> = None;
    for command in TEXT_COMMANDS {
        for token in command.tokens {
            let matches = line
                .get(..token.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(token))
                && line[token.len()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace);
            if matches && best.is_none_or(|(_, len)| token.len() > len) {
                best = Some((command, token.len()));
            }
        }
    }
    best.map(|(command, len)| {
        let argument = line[len..].trim();
        (
            command,
            (!argument.is_empty()).then(|| argument.to_string()),
        )
    })
}

#[derive(Clone, Copy)]
struct ActionSpec {
    permission: Option<&'static str>,
    error_code: i32,
    handler: ActionHandler,
}

/// Routes control requests to the orchestrator.
pub struct CommandDispatcher {
    hypervisor: Arc<Hypervisor>,
    actions: HashMap<&'static str, ActionSpec>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<_> = self.actions.keys().collect();
        actions.sort();
        f.debug_struct("CommandDispatcher")
            .field("actions", &actions)
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Build the action table for `hypervisor`.
    pub fn new(hypervisor: Arc<Hypervisor>) -> Self {
        let mut actions = HashMap::new();
        let mut register =
            |action: &'static str, permission: Option<&'static str>, error_code: i32, handler: ActionHandler| {
                actions.insert(
                    action,
                    ActionSpec {
                        permission,
                        error_code,
                        handler,
                    },
                );
            };

        register("alloc", Some("alloc"), -9001, alloc);
        register("free", Some("free"), -9002, free);
        register("roster", Some("rostervm"), -9003, roster);
        register("clone", Some("clone"), -9004, clone_vm);
        register("ip", Some("ip"), -9005, ip);
        register("libvirt-uri", None, -9006, libvirt_uri);
        register("alloc_for_migration", Some("migration"), -9007, alloc_for_migration);
        register("free_for_migration", Some("migration"), -9008, free_for_migration);
        register("capabilities", Some("capabilities"), -9009, capabilities);

        Self {
            hypervisor,
            actions,
        }
    }

    /// The orchestrator behind this dispatcher.
    pub fn hypervisor(&self) -> &Arc<Hypervisor> {
        &self.hypervisor
    }

    /// Whether `action` is a known token.
    pub fn knows(&self, action: &str) -> bool {
        action == TEXT_ACTION || self.actions.contains_key(action)
    }

    /// Run one plain-text command line from `from` and return the reply text.
    pub async fn dispatch_text(&self, from: &str, line: &str) -> String {
        let Some((command, argument)) = match_text_command(line) else {
            debug!(from = %from, "Unknown text command");
            return format!("I don't understand {:?}. You can type 'help' to get help", line.trim());
        };
        let token = command.tokens[0];

        if let Some(permission) = command.permission {
            match self.hypervisor.permissions().check(from, permission).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(command = token, from = %from, permission, "Permission denied");
                    return format!("Sorry, you don't have the permission {permission:?} to do that");
                }
                Err(e) => {
                    error!(command = token, error = %e, "Permission check failed");
                    return format!("Error: {e}");
                }
            }
        }

        let task = tokio::spawn((command.handler)(
            self.hypervisor.clone(),
            from.to_string(),
            argument,
        ));
        match task.await {
            Ok(Ok(reply)) => {
                info!(command = token, from = %from, "Text command completed");
                reply
            }
            Ok(Err(e)) => {
                warn!(command = token, from = %from, error = %e, "Text command failed");
                format!("Error: {e}")
            }
            Err(join_error) => {
                error!(command = token, from = %from, "Text command panicked: {}", join_error);
                format!("Error: command {token} aborted")
            }
        }
    }

    /// Resolve, authorize and run one request.
    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let ControlRequest {
            id,
            from,
            action,
            attributes,
            ..
        } = request;

        if action == TEXT_ACTION {
            let body = attributes.get("body").map(String::as_str).unwrap_or_default();
            let reply = self.dispatch_text(&from, body).await;
            return ControlResponse {
                id,
                outcome: Outcome::Result {
                    payload: json!({ "body": reply }),
                },
            };
        }

        let Some(spec) = self.actions.get(action.as_str()).copied() else {
            debug!(action = %action, from = %from, "No such action");
            return ControlResponse {
                id,
                outcome: Outcome::NoSuchAction { action },
            };
        };

        if let Some(permission) = spec.permission {
            match self.hypervisor.permissions().check(&from, permission).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(action = %action, from = %from, permission, "Permission denied");
                    let denied = Error::PermissionDenied {
                        user: from,
                        permission: permission.to_string(),
                    };
                    return ControlResponse {
                        id,
                        outcome: error_outcome(PERMISSION_DENIED_CODE, &denied),
                    };
                }
                Err(e) => {
                    error!(action = %action, error = %e, "Permission check failed");
                    return ControlResponse {
                        id,
                        outcome: error_outcome(spec.error_code, &e),
                    };
                }
            }
        }

        let context = ActionContext {
            caller: from.clone(),
            attributes,
        };
        let task = tokio::spawn((spec.handler)(self.hypervisor.clone(), context));
        let outcome = match task.await {
            Ok(Ok(payload)) => {
                info!(action = %action, from = %from, "Action completed");
                Outcome::Result { payload }
            }
            Ok(Err(e)) => {
                warn!(action = %action, from = %from, error = %e, "Action failed");
                match &e {
                    Error::Virtualization(driver) => error_outcome(driver.code(), &e),
                    _ => error_outcome(spec.error_code, &e),
                }
            }
            Err(join_error) => {
                error!(action = %action, from = %from, "Action panicked: {}", join_error);
                error_outcome(
                    spec.error_code,
                    &Error::Internal(format!("action {action} aborted")),
                )
            }
        };

        ControlResponse { id, outcome }
    }
}

fn error_outcome(code: i32, error: &Error) -> Outcome {
    let namespace = match error {
        Error::Virtualization(_) => NS_LIBVIRT_ERROR,
        _ => NS_HYPERVISOR_ERROR,
    };
    Outcome::Error {
        code,
        kind: error.error_code().to_string(),
        namespace: namespace.to_string(),
        message: error.to_string(),
    }
}

async fn resolve(hypervisor: &Hypervisor, identifier: &str) -> Result<String> {
    hypervisor
        .get_vm_by_identifier(identifier)
        .await
        .map(|w| w.instance().identity.clone())
        .ok_or_else(|| Error::NotFound(identifier.to_string()))
}

fn alloc(hypervisor: Arc<Hypervisor>, ctx: ActionContext) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let worker = hypervisor
            .alloc(Some(ctx.caller.as_str()), ctx.optional("name"), true)
            .await?;
        let vm = worker.instance();
        Ok(json!({
            "address": vm.address.bare(),
            "identity": vm.identity,
            "name": vm.name,
        }))
    })
}

fn free(hypervisor: Arc<Hypervisor>, ctx: ActionContext) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let identity = resolve(&hypervisor, ctx.required("identifier")?).await?;
        hypervisor.free(&identity).await?;
        Ok(json!({ "identity": identity }))
    })
}

fn roster(hypervisor: Arc<Hypervisor>, _ctx: ActionContext) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move { Ok(serde_json::to_value(hypervisor.roster_entries().await)?) })
}

fn clone_vm(hypervisor: Arc<Hypervisor>, ctx: ActionContext) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let source = resolve(&hypervisor, ctx.required("identifier")?).await?;
        let worker = hypervisor
            .clone_vm(&source, Some(ctx.caller.as_str()), ctx.optional("name"))
            .await?;
        let vm = worker.instance();
        Ok(json!({
            "source": source,
            "address": vm.address.bare(),
            "identity": vm.identity,
            "name": vm.name,
        }))
    })
}

fn ip(hypervisor: Arc<Hypervisor>, _ctx: ActionContext) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move { Ok(json!({ "ip": hypervisor.ip() })) })
}

fn libvirt_uri(
    hypervisor: Arc<Hypervisor>,
    _ctx: ActionContext,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move { Ok(json!({ "uri": hypervisor.migration_libvirt_uri() })) })
}

fn capabilities(
    hypervisor: Arc<Hypervisor>,
    _ctx: ActionContext,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let capabilities = hypervisor.capabilities().await?;
        Ok(json!({ "capabilities": capabilities }))
    })
}

fn alloc_for_migration(
    hypervisor: Arc<Hypervisor>,
    ctx: ActionContext,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let worker = hypervisor
            .alloc_for_migration(
                ctx.required("address")?,
                ctx.required("name")?,
                ctx.required("credential")?,
            )
            .await?;
        Ok(json!({ "address": worker.instance().address.bare() }))
    })
}

fn free_for_migration(
    hypervisor: Arc<Hypervisor>,
    ctx: ActionContext,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let identity = resolve(&hypervisor, ctx.required("identifier")?).await?;
        let worker = hypervisor.free_for_migration(&identity).await?;
        Ok(json!({ "address": worker.instance().address.bare() }))
    })
}

fn text_capabilities(
    hypervisor: Arc<Hypervisor>,
    _caller: String,
    _argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move { hypervisor.capabilities().await })
}

fn text_libvirt_uri(
    hypervisor: Arc<Hypervisor>,
    _caller: String,
    _argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        Ok(format!(
            "Sure, my libvirt URI is {}",
            hypervisor.migration_libvirt_uri()
        ))
    })
}

fn text_ip(
    hypervisor: Arc<Hypervisor>,
    _caller: String,
    _argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move { Ok(format!("Sure, my IP is {}", hypervisor.ip())) })
}

fn text_roster(
    hypervisor: Arc<Hypervisor>,
    _caller: String,
    _argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        let mut reply = String::from("Here is the content of my roster:\n");
        for entry in hypervisor.roster_entries().await {
            reply.push_str(&format!(" - {} ({})\n", entry.name, entry.address));
        }
        Ok(reply)
    })
}

fn text_alloc(
    hypervisor: Arc<Hypervisor>,
    caller: String,
    argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        let worker = hypervisor
            .alloc(Some(caller.as_str()), argument.as_deref(), true)
            .await?;
        let vm = worker.instance();
        Ok(format!(
            "Virtual machine with name {} has been allocated using address {}",
            vm.name,
            vm.address.bare()
        ))
    })
}

fn text_free(
    hypervisor: Arc<Hypervisor>,
    _caller: String,
    argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        let Some(identifier) = argument else {
            return Ok(WRONG_FORMAT.to_string());
        };
        let Some(worker) = hypervisor.get_vm_by_identifier(&identifier).await else {
            return Ok(format!(
                "It seems that the virtual machine {identifier} doesn't exist."
            ));
        };
        let address = worker.instance().address.bare();
        hypervisor.free(&worker.instance().identity).await?;
        Ok(format!("Virtual machine {address} has been freed."))
    })
}

fn text_clone(
    hypervisor: Arc<Hypervisor>,
    caller: String,
    argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        let Some(identifier) = argument else {
            return Ok(WRONG_FORMAT.to_string());
        };
        let Some(worker) = hypervisor.get_vm_by_identifier(&identifier).await else {
            return Ok(format!(
                "It seems that the virtual machine {identifier} doesn't exist."
            ));
        };
        let address = worker.instance().address.bare();
        hypervisor
            .clone_vm(&worker.instance().identity, Some(caller.as_str()), None)
            .await?;
        Ok(format!("Cloning of virtual machine {address} has started."))
    })
}

fn text_help(
    _hypervisor: Arc<Hypervisor>,
    _caller: String,
    _argument: Option<String>,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        let mut reply = String::from("Here are the commands I understand:\n");
        for command in TEXT_COMMANDS {
            let tokens = command.tokens.join(", ");
            match command.parameter {
                Some(parameter) => reply.push_str(&format!(
                    " - {tokens} {parameter}: {}\n",
                    command.description
                )),
                None => reply.push_str(&format!(" - {tokens}: {}\n", command.description)),
            }
        }
        Ok(reply)
    })
}
