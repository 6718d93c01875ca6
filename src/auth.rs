//! OAuth2 client-credentials token acquisition.
//!
//! One POST against the tenant's authority per collection run. The token is
//! opaque to the rest of the pipeline; failures map to a tenant-scoped
//! [`CollectError::Auth`] so a bad tenant never aborts a multi-tenant batch.

use serde_json::Value;

use crate::config::GraphConfig;
use crate::error::CollectError;
use crate::models::Tenant;

/// A bearer token. `Debug` never prints the secret.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
}

impl AccessToken {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn as_str(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Acquire an app-only token for a tenant.
///
/// Non-success responses and malformed bodies become `CollectError::Auth`
/// with the HTTP status or parse failure as the reason; the response body is
/// not echoed into the error, so credentials can never leak through error
/// strings.
pub async fn acquire_token(
    graph: &GraphConfig,
    tenant: &Tenant,
) -> Result<AccessToken, CollectError> {
    let url = format!(
        "{}/{}/oauth2/v2.0/token",
        graph.authority.trim_end_matches('/'),
        tenant.tenant_id
    );

    let params = [
        ("client_id", tenant.client_id.as_str()),
        ("client_secret", tenant.client_secret.as_str()),
        ("scope", graph.scope.as_str()),
        ("grant_type", "client_credentials"),
    ];

    let auth_err = |reason: String| CollectError::Auth {
        tenant: tenant.name.clone(),
        reason,
    };

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(graph.timeout_secs))
        .build()
        .map_err(|e| auth_err(format!("failed to build HTTP client: {}", e)))?;

    let resp = http
        .post(&url)
        .form(&params)
        .send()
        .await
        .map_err(|e| auth_err(format!("token request failed: {}", e)))?;

    if !resp.status().is_success() {
        return Err(auth_err(format!(
            "token endpoint returned HTTP {}",
            resp.status()
        )));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| auth_err(format!("invalid token response: {}", e)))?;

    let token = body
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| auth_err("token response missing access_token".to_string()))?;

    Ok(AccessToken::new(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken::new("eyJ0eXAi...".to_string());
        assert_eq!(format!("{:?}", token), "AccessToken(***)");
    }
}
