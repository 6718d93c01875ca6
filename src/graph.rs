//! Remote mail API client (Microsoft Graph-shaped).
//!
//! Thin wrapper over reqwest: user listing, mailbox probe, message pages,
//! raw MIME, and attachment listing. Listing responses carry items under
//! `value` and an opaque continuation URL under `@odata.nextLink`; the
//! client decodes pages and leaves pagination policy to
//! [`QuotaPager`](crate::paginator::QuotaPager).

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::AccessToken;
use crate::config::GraphConfig;
use crate::models::RemoteUser;
use crate::paginator::{Cursor, Page, PageSource, QuotaPager};

pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    token: AccessToken,
}

/// An attachment record as returned by the attachments listing. Absent
/// `contentBytes` means the remote offered metadata only.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAttachment {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "contentBytes")]
    pub content_bytes: Option<String>,
}

impl GraphClient {
    pub fn new(config: &GraphConfig, token: AccessToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token.as_str()))
    }

    /// Enumerate all users in the tenant directory, following pagination to
    /// completion. User enumeration carries no quota — it is bounded by
    /// directory size, not a collection parameter.
    pub async fn list_users(&self) -> Result<Vec<RemoteUser>> {
        let first = format!(
            "{}/users?$select=id,displayName,userPrincipalName",
            self.base_url
        );
        let source = UserPages { graph: self };
        let mut pager = QuotaPager::unbounded(&source, first);
        let mut users = Vec::new();
        while let Some(batch) = pager.next_page().await? {
            users.extend(batch);
        }
        Ok(users)
    }

    /// Probe whether the user has a mailbox by fetching their Inbox folder.
    /// Users without one (unlicensed, resource accounts) answer 404.
    pub async fn has_mailbox(&self, user_id: &str) -> Result<bool> {
        let url = format!("{}/users/{}/mailFolders/Inbox", self.base_url, user_id);
        let resp = self.get(&url).send().await?;
        Ok(resp.status().is_success())
    }

    /// First-page URL for a user's message listing with the given `$top`.
    pub fn first_messages_url(&self, user_id: &str, top: u64) -> String {
        format!("{}/users/{}/messages?$top={}", self.base_url, user_id, top)
    }

    /// Fetch the raw MIME representation of a message.
    pub async fn fetch_mime(&self, user_id: &str, message_id: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/users/{}/messages/{}/$value",
            self.base_url, user_id, message_id
        );
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            bail!("MIME fetch returned HTTP {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// List a message's attachments.
    pub async fn list_attachments(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Vec<RawAttachment>> {
        let url = format!(
            "{}/users/{}/messages/{}/attachments",
            self.base_url, user_id, message_id
        );
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            bail!("attachments listing returned HTTP {}", resp.status());
        }
        let body: Value = resp.json().await?;
        let items = body
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    async fn fetch_listing_page(&self, url: &str) -> Result<Page<Value>> {
        let resp = self.get(url).send().await?;
        if !resp.status().is_success() {
            bail!("listing returned HTTP {}", resp.status());
        }
        let body: Value = resp.json().await?;
        Ok(parse_listing(body))
    }
}

/// Decode a listing body into a page. The continuation URL is opaque: it is
/// followed verbatim, never parsed or constructed.
fn parse_listing(body: Value) -> Page<Value> {
    let items = body
        .get("value")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let next = match body.get("@odata.nextLink").and_then(Value::as_str) {
        Some(url) => Cursor::Next(url.to_string()),
        None => Cursor::Done,
    };
    Page { items, next }
}

/// Message listing pages for one user.
pub struct MessagePages<'a> {
    graph: &'a GraphClient,
}

impl<'a> MessagePages<'a> {
    pub fn new(graph: &'a GraphClient) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl PageSource for MessagePages<'_> {
    type Item = Value;

    async fn fetch(&self, url: &str) -> Result<Page<Value>> {
        self.graph.fetch_listing_page(url).await
    }
}

/// Directory user pages.
struct UserPages<'a> {
    graph: &'a GraphClient,
}

#[async_trait]
impl PageSource for UserPages<'_> {
    type Item = RemoteUser;

    async fn fetch(&self, url: &str) -> Result<Page<RemoteUser>> {
        let page = self.graph.fetch_listing_page(url).await?;
        let users = page
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<RemoteUser>, _>>()?;
        Ok(Page {
            items: users,
            next: page.next,
        })
    }
}
