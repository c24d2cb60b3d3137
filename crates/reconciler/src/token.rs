use crate::clock::Clock;
use crate::error::AuthError;
use crate::model::{AccessToken, ClientAuthMethod, Credential, CredentialKey, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Tokens are refreshed this long before the authority says they expire.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(60);
/// Pause before the single retry after a 5xx or network failure.
pub const TOKEN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// OAuth2 client-credentials token source with an in-memory cache.
///
/// Works against any RFC 6749 token endpoint (Cognito domains, Entra, Okta, ...).
/// Tokens are cached per credential identity until `expires_at - skew`; the
/// refresh itself runs under a write lock so concurrent callers share one request.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    skew: Duration,
    cache: RwLock<HashMap<CredentialKey, AccessToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<ExpiresIn>,
    #[serde(default)]
    token_type: Option<String>,
}

// Some authorities send `expires_in` as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Secs(u64),
    Text(String),
}

impl ExpiresIn {
    fn secs(&self) -> Option<u64> {
        match self {
            Self::Secs(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

enum Attempt {
    Done(AccessToken),
    Retryable(AuthError),
    Fatal(AuthError),
}

impl TokenProvider {
    #[must_use]
    pub fn new(http: reqwest::Client, clock: Arc<dyn Clock>, skew: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                clock,
                skew,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Return a cached token for `credential`, requesting a new one when missing or stale.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` when the authority rejects the request, stays unavailable after
    /// one retry, or answers with a body lacking `access_token` / `expires_in`.
    pub async fn get_token(&self, credential: &Credential) -> Result<AccessToken, AuthError> {
        let key = credential.cache_key();

        // Fast path: fresh token already cached.
        {
            let cache = self.inner.cache.read().await;
            if let Some(token) = cache.get(&key)
                && token.is_fresh(self.inner.clock.now(), self.inner.skew)
            {
                return Ok(token.clone());
            }
        }

        let mut cache = self.inner.cache.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = cache.get(&key)
            && token.is_fresh(self.inner.clock.now(), self.inner.skew)
        {
            return Ok(token.clone());
        }

        let token = self.request_token(credential).await?;
        cache.insert(key, token.clone());
        Ok(token)
    }

    /// Drop the cached token so the next call goes back to the authority.
    pub async fn invalidate(&self, credential: &Credential) {
        self.inner.cache.write().await.remove(&credential.cache_key());
    }

    async fn request_token(&self, credential: &Credential) -> Result<AccessToken, AuthError> {
        match self.attempt(credential).await {
            Attempt::Done(token) => Ok(token),
            Attempt::Fatal(err) => Err(err),
            Attempt::Retryable(err) => {
                tracing::warn!(
                    endpoint = %credential.token_endpoint,
                    error = %err,
                    "token request failed, retrying once"
                );
                self.inner.clock.sleep(TOKEN_RETRY_DELAY).await;
                match self.attempt(credential).await {
                    Attempt::Done(token) => Ok(token),
                    Attempt::Fatal(err) | Attempt::Retryable(err) => Err(err),
                }
            }
        }
    }

    async fn attempt(&self, credential: &Credential) -> Attempt {
        let endpoint = credential.token_endpoint.to_string();
        let scope = credential.scopes.join(" ");

        let mut form: Vec<(&str, &str)> = vec![("grant_type", "client_credentials")];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        let mut req = self.inner.http.post(credential.token_endpoint.clone());
        match credential.auth_method {
            ClientAuthMethod::Basic => {
                req = req.basic_auth(
                    &credential.client_id,
                    Some(credential.client_secret.expose()),
                );
            }
            ClientAuthMethod::Post => {
                form.push(("client_id", credential.client_id.as_str()));
                form.push(("client_secret", credential.client_secret.expose()));
            }
        }

        let resp = match req
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Retryable(AuthError::Unavailable {
                    endpoint,
                    message: e.to_string(),
                });
            }
        };

        let status = resp.status();
        if status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Attempt::Retryable(AuthError::Unavailable {
                endpoint,
                message: format!("HTTP {status}: {}", truncate(&body)),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Attempt::Fatal(AuthError::Rejected {
                endpoint,
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return Attempt::Retryable(AuthError::Unavailable {
                    endpoint,
                    message: format!("read token response: {e}"),
                });
            }
        };
        match self.parse_token(&endpoint, &bytes) {
            Ok(token) => {
                tracing::info!(
                    endpoint = %endpoint,
                    client_id = %credential.client_id,
                    "obtained access token"
                );
                Attempt::Done(token)
            }
            Err(e) => Attempt::Fatal(e),
        }
    }

    fn parse_token(&self, endpoint: &str, body: &[u8]) -> Result<AccessToken, AuthError> {
        let malformed = |message: String| AuthError::Malformed {
            endpoint: endpoint.to_string(),
            message,
        };
        let parsed: TokenResponse =
            serde_json::from_slice(body).map_err(|e| malformed(format!("invalid json: {e}")))?;
        let value = parsed
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| malformed("missing access_token".to_string()))?;
        let expires_in = parsed
            .expires_in
            .as_ref()
            .ok_or_else(|| malformed("missing expires_in".to_string()))?
            .secs()
            .ok_or_else(|| malformed("expires_in is not a number of seconds".to_string()))?;

        let expires_at = self
            .inner
            .clock
            .now()
            .checked_add(Duration::from_secs(expires_in))
            .ok_or_else(|| malformed(format!("expires_in {expires_in} is out of range")))?;

        Ok(AccessToken {
            value: Secret::new(value),
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
        })
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn provider() -> TokenProvider {
        TokenProvider::new(
            reqwest::Client::new(),
            Arc::new(ManualClock::new()),
            DEFAULT_EXPIRY_SKEW,
        )
    }

    #[test]
    fn parse_accepts_string_expires_in_and_defaults_token_type() {
        let token = provider()
            .parse_token("t", br#"{"access_token":"abc","expires_in":"3600"}"#)
            .expect("token");
        assert_eq!(token.value.expose(), "abc");
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let p = provider();
        let err = p.parse_token("t", br#"{"expires_in":3600}"#).unwrap_err();
        assert!(err.to_string().contains("missing access_token"));

        let err = p.parse_token("t", br#"{"access_token":"abc"}"#).unwrap_err();
        assert!(err.to_string().contains("missing expires_in"));

        let err = p.parse_token("t", b"<html>").unwrap_err();
        assert!(matches!(err, AuthError::Malformed { .. }));
    }

    #[test]
    fn huge_expires_in_is_malformed() {
        let err = provider()
            .parse_token(
                "t",
                br#"{"access_token":"abc","expires_in":18446744073709551615}"#,
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::Malformed { .. }), "{err:?}");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(400);
        let out = truncate(&long);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 515);
    }
}
