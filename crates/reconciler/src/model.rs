//! Resource shapes shared by the registrar, the reconciler and the control-plane client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use url::Url;

/// How the client authenticates itself to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientAuthMethod {
    /// HTTP Basic with `client_id:client_secret`.
    Basic,
    /// `client_id` / `client_secret` form fields.
    #[default]
    Post,
}

/// Secret string whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// OAuth2 client-credentials identity. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: Secret,
    pub token_endpoint: Url,
    pub scopes: Vec<String>,
    pub auth_method: ClientAuthMethod,
}

/// Identity of a credential for token caching (the secret is not part of it).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    token_endpoint: String,
    client_id: String,
    scopes: Vec<String>,
}

impl Credential {
    #[must_use]
    pub fn cache_key(&self) -> CredentialKey {
        let mut scopes = self.scopes.clone();
        scopes.sort();
        scopes.dedup();
        CredentialKey {
            token_endpoint: self.token_endpoint.to_string(),
            client_id: self.client_id.clone(),
            scopes,
        }
    }
}

/// Bearer token obtained from the identity authority. Never persisted.
#[derive(Clone)]
pub struct AccessToken {
    pub value: Secret,
    pub token_type: String,
    pub expires_at: Instant,
}

impl AccessToken {
    /// Whether the token may still be handed out at `now`, keeping `skew` in reserve.
    #[must_use]
    pub fn is_fresh(&self, now: Instant, skew: Duration) -> bool {
        now.checked_add(skew).is_some_and(|t| t < self.expires_at)
    }

    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value.expose())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &self.value)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Kind of backend a gateway target points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    /// Function reference is a serverless function ARN.
    #[default]
    Lambda,
    /// Function reference is the URI of an OpenAPI document.
    OpenApi,
    /// Function reference is the URI of a Smithy model.
    Smithy,
}

/// One invocable tool backend to attach to a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTarget {
    pub name: String,
    pub function_reference: String,
    #[serde(rename = "type", default)]
    pub target_type: TargetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// JWT authorizer settings for the gateway's inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    pub discovery_url: Url,
    pub audiences: Vec<String>,
}

/// Desired gateway, immutable for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySpec {
    pub name: String,
    pub description: Option<String>,
    pub role_arn: Option<String>,
    pub auth: GatewayAuthConfig,
    pub targets: Vec<GatewayTarget>,
    pub tags: BTreeMap<String, String>,
}

/// Tag stamped on every gateway this tool creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipTag {
    pub key: String,
    pub value: String,
}

impl Default for OwnershipTag {
    fn default() -> Self {
        Self {
            key: "managed-by".to_string(),
            value: "unrelated-gateway-deploy".to_string(),
        }
    }
}

impl OwnershipTag {
    #[must_use]
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        tags.get(&self.key).is_some_and(|v| *v == self.value)
    }

    #[must_use]
    pub fn as_tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.key.clone(), self.value.clone())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    Creating,
    Updating,
    #[serde(alias = "READY")]
    Active,
    Failed,
    UpdateUnsuccessful,
    Deleting,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl GatewayStatus {
    #[must_use]
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed | Self::UpdateUnsuccessful)
    }

    #[must_use]
    pub fn is_going_away(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Updating => "UPDATING",
            Self::Active => "ACTIVE",
            Self::Failed => "FAILED",
            Self::UpdateUnsuccessful => "UPDATE_UNSUCCESSFUL",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Gateway as observed on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResource {
    #[serde(rename = "gatewayId")]
    pub id: String,
    pub name: String,
    pub status: GatewayStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Creating,
    Updating,
    #[serde(alias = "ACTIVE")]
    Ready,
    Failed,
    UpdateUnsuccessful,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Updating => "UPDATING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
            Self::UpdateUnsuccessful => "UPDATE_UNSUCCESSFUL",
            Self::Deleting => "DELETING",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Target attached to a gateway, as observed on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResource {
    #[serde(rename = "targetId")]
    pub id: String,
    pub name: String,
    pub status: TargetStatus,
}
