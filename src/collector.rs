//! Mailbox and tenant collection orchestration.
//!
//! [`collect_tenant`] runs one tenant end to end: token acquisition, user
//! enumeration, mailbox probing, and per-user message collection via
//! [`collect_mailbox`]. Failures never steer control flow past their scope —
//! they are collected into the outcome as values, so a bad tenant or user
//! shows up in the result instead of aborting the batch.

use std::path::{Path, PathBuf};

use base64::Engine;
use tracing::{debug, warn};

use crate::auth::acquire_token;
use crate::config::{Config, GraphConfig};
use crate::error::CollectError;
use crate::graph::{GraphClient, MessagePages, RawAttachment};
use crate::models::{AttachmentMeta, CollectedMessage, RemoteUser, Tenant};
use crate::paginator::{initial_page_size, QuotaPager};
use crate::task::TaskHandle;

/// Per-run collection options, resolved from config plus caller overrides.
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Message quota per mailbox; unbounded when `None`.
    pub mails_per_user: Option<u64>,
    pub include_attachments: bool,
    pub page_size: u64,
    pub blob_dir: Option<PathBuf>,
}

impl CollectOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mails_per_user: config.collection.mails_per_user,
            include_attachments: config.collection.include_attachments,
            page_size: config.graph.page_size,
            blob_dir: config.collection.blob_dir.clone(),
        }
    }
}

/// Result of collecting one mailbox: the messages in remote listing order
/// plus every absorbed error.
#[derive(Debug, Default)]
pub struct MailboxOutcome {
    pub messages: Vec<CollectedMessage>,
    pub errors: Vec<CollectError>,
}

/// Result of collecting one tenant.
#[derive(Debug)]
pub struct TenantOutcome {
    pub tenant: String,
    pub messages: Vec<CollectedMessage>,
    pub errors: Vec<CollectError>,
}

impl TenantOutcome {
    fn aborted(tenant: &Tenant, error: CollectError) -> Self {
        Self {
            tenant: tenant.name.clone(),
            messages: Vec::new(),
            errors: vec![error],
        }
    }
}

/// Collect every mailbox-bearing user of a tenant.
///
/// Progress is reported through `task` within the `(lo, hi)` percent span
/// this tenant occupies in the overall run.
pub async fn collect_tenant(
    graph_cfg: &GraphConfig,
    tenant: &Tenant,
    opts: &CollectOptions,
    task: &TaskHandle,
    span: (u8, u8),
) -> TenantOutcome {
    let (lo, hi) = span;
    task.progress(
        "authenticating",
        lo,
        format!("Acquiring token for tenant {}", tenant.name),
    );

    let token = match acquire_token(graph_cfg, tenant).await {
        Ok(token) => token,
        Err(e) => {
            warn!(tenant = %tenant.name, error = %e, "token acquisition failed");
            return TenantOutcome::aborted(tenant, e);
        }
    };

    let graph = match GraphClient::new(graph_cfg, token) {
        Ok(graph) => graph,
        Err(e) => {
            return TenantOutcome::aborted(
                tenant,
                CollectError::Auth {
                    tenant: tenant.name.clone(),
                    reason: format!("failed to build API client: {}", e),
                },
            );
        }
    };

    // A user listing failure aborts the whole tenant: partial user lists
    // would silently narrow the snapshot.
    let users = match graph.list_users().await {
        Ok(users) => users,
        Err(e) => {
            warn!(tenant = %tenant.name, error = %e, "user listing failed");
            return TenantOutcome::aborted(
                tenant,
                CollectError::Listing {
                    scope: format!("users of tenant {}", tenant.name),
                    reason: e.to_string(),
                },
            );
        }
    };
    debug!(tenant = %tenant.name, users = users.len(), "enumerated directory");

    let mut messages = Vec::new();
    let mut errors = Vec::new();
    let total = users.len().max(1) as u64;

    for (i, user) in users.iter().enumerate() {
        match graph.has_mailbox(&user.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(user = user.principal(), "skipping user without mailbox");
                continue;
            }
            Err(e) => {
                // Probe failure is a per-user failure; remaining users
                // still run.
                warn!(user = user.principal(), error = %e, "mailbox probe failed");
                errors.push(CollectError::Listing {
                    scope: format!("mailbox probe for {}", user.principal()),
                    reason: e.to_string(),
                });
                continue;
            }
        }

        let pct = lo + (((hi - lo) as u64 * i as u64) / total) as u8;
        task.progress(
            "collecting",
            pct,
            format!(
                "Collecting mailbox {} ({}/{})",
                user.principal(),
                i + 1,
                users.len()
            ),
        );

        let outcome = collect_mailbox(&graph, &tenant.name, user, opts).await;
        messages.extend(outcome.messages);
        errors.extend(outcome.errors);
    }

    TenantOutcome {
        tenant: tenant.name.clone(),
        messages,
        errors,
    }
}

/// Collect one user's mailbox up to the quota.
///
/// MIME and attachment fetches are best-effort side fetches: a failure is
/// recorded and the message still ships with whatever was retrieved. A
/// listing failure mid-pagination keeps the pages already yielded.
pub async fn collect_mailbox(
    graph: &GraphClient,
    tenant_name: &str,
    user: &RemoteUser,
    opts: &CollectOptions,
) -> MailboxOutcome {
    let principal = user.principal();
    debug!(
        user = principal,
        display = user.display_name.as_deref().unwrap_or("-"),
        "collecting mailbox"
    );
    let top = initial_page_size(opts.mails_per_user, opts.page_size);
    let first_url = graph.first_messages_url(&user.id, top);
    let source = MessagePages::new(graph);
    let mut pager = QuotaPager::new(&source, first_url, opts.mails_per_user, opts.page_size);

    let mut outcome = MailboxOutcome::default();

    loop {
        let items = match pager.next_page().await {
            Ok(Some(items)) => items,
            Ok(None) => break,
            Err(e) => {
                warn!(user = principal, error = %e, "message listing failed");
                outcome.errors.push(CollectError::Listing {
                    scope: format!("messages of {}", principal),
                    reason: e.to_string(),
                });
                break;
            }
        };

        for payload in items {
            let message_id = match payload.get("id").and_then(|v| v.as_str()) {
                Some(id) => id.to_string(),
                None => {
                    warn!(user = principal, "listed message without id, skipping");
                    continue;
                }
            };

            let user_dir = opts
                .blob_dir
                .as_deref()
                .map(|dir| dir.join(sanitize(tenant_name)).join(sanitize(principal)));

            let eml_path = match graph.fetch_mime(&user.id, &message_id).await {
                Ok(mime) => store_mime(user_dir.as_deref(), &message_id, &mime),
                Err(e) => {
                    debug!(message = %message_id, error = %e, "raw MIME unavailable");
                    outcome.errors.push(CollectError::Fetch {
                        message_id: message_id.clone(),
                        reason: format!("MIME: {}", e),
                    });
                    None
                }
            };

            let attachments = if opts.include_attachments {
                match graph.list_attachments(&user.id, &message_id).await {
                    Ok(raw) => store_attachments(user_dir.as_deref(), &message_id, raw),
                    Err(e) => {
                        warn!(message = %message_id, error = %e, "attachment listing failed");
                        outcome.errors.push(CollectError::Fetch {
                            message_id: message_id.clone(),
                            reason: format!("attachments: {}", e),
                        });
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            outcome.messages.push(CollectedMessage {
                tenant: tenant_name.to_string(),
                user_principal: principal.to_string(),
                message_id,
                payload,
                eml_path,
                attachments,
            });
        }
    }

    outcome
}

/// Write the raw MIME blob, returning its path. Disk failures are absorbed:
/// the message proceeds without a blob reference.
fn store_mime(user_dir: Option<&Path>, message_id: &str, mime: &[u8]) -> Option<PathBuf> {
    let dir = user_dir?;
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "cannot create blob directory");
        return None;
    }
    let path = dir.join(format!("{}.eml", sanitize(message_id)));
    match std::fs::write(&path, mime) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot write MIME blob");
            None
        }
    }
}

/// Decode and store attachment content, falling back to metadata-only when
/// content bytes are absent or undecodable.
fn store_attachments(
    user_dir: Option<&Path>,
    message_id: &str,
    raw: Vec<RawAttachment>,
) -> Vec<AttachmentMeta> {
    let attach_dir = user_dir.map(|dir| dir.join("attachments").join(sanitize(message_id)));

    raw.into_iter()
        .map(|att| {
            let name = att
                .name
                .clone()
                .or_else(|| att.id.clone())
                .unwrap_or_else(|| "attachment".to_string());

            let content = att
                .content_bytes
                .as_deref()
                .and_then(|b64| match base64::engine::general_purpose::STANDARD.decode(b64) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(attachment = %name, error = %e, "undecodable attachment content");
                        None
                    }
                });

            let size = content.as_ref().map(|c| c.len() as u64).unwrap_or(0);
            let stored_path = match (&content, &attach_dir) {
                (Some(bytes), Some(dir)) => {
                    if let Err(e) = std::fs::create_dir_all(dir) {
                        warn!(dir = %dir.display(), error = %e, "cannot create attachment directory");
                        None
                    } else {
                        let path = dir.join(sanitize(&name));
                        match std::fs::write(&path, bytes) {
                            Ok(()) => Some(path),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "cannot write attachment");
                                None
                            }
                        }
                    }
                }
                _ => None,
            };

            AttachmentMeta {
                name,
                content_type: att.content_type,
                size,
                stored_path,
            }
        })
        .collect()
}

/// Remote identifiers can contain path-hostile characters; blob file names
/// must stay within the user directory.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize("AAMkAGI2-_="), "AAMkAGI2-_=");
    }
}
