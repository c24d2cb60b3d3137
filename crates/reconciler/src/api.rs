use crate::error::{ApiError, ApiErrorKind};
use crate::model::{
    Credential, GatewayResource, GatewaySpec, GatewayTarget, TargetResource, TargetType,
};
use crate::retry::Retrier;
use crate::token::TokenProvider;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Remote gateway control plane (create/get/list/delete gateways and their targets).
///
/// Implementations classify every failure into an [`ApiError`]; callers attach
/// step and resource context.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_gateway(
        &self,
        req: &CreateGatewayRequest,
    ) -> Result<GatewayResource, ApiError>;

    async fn get_gateway(&self, gateway_id: &str) -> Result<GatewayResource, ApiError>;

    async fn list_gateways(&self, page: PageRequest) -> Result<Page<GatewayResource>, ApiError>;

    async fn delete_gateway(&self, gateway_id: &str) -> Result<(), ApiError>;

    async fn attach_target(
        &self,
        gateway_id: &str,
        req: &AttachTargetRequest,
    ) -> Result<TargetResource, ApiError>;

    async fn get_target(
        &self,
        gateway_id: &str,
        target_id: &str,
    ) -> Result<TargetResource, ApiError>;

    async fn list_targets(
        &self,
        gateway_id: &str,
        page: PageRequest,
    ) -> Result<Page<TargetResource>, ApiError>;

    async fn detach_target(&self, gateway_id: &str, target_id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub next_token: Option<String>,
    pub max_results: u32,
}

impl PageRequest {
    #[must_use]
    pub fn first(max_results: u32) -> Self {
        Self {
            next_token: None,
            max_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGatewayRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub protocol_type: String,
    pub authorizer_type: String,
    pub authorizer_configuration: AuthorizerConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizerConfiguration {
    pub custom_jwt_authorizer: CustomJwtAuthorizer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomJwtAuthorizer {
    pub discovery_url: String,
    pub allowed_audience: Vec<String>,
}

impl CreateGatewayRequest {
    /// MCP gateway with a custom JWT authorizer; `extra_tags` are merged over the spec's tags.
    #[must_use]
    pub fn from_spec(spec: &GatewaySpec, extra_tags: &BTreeMap<String, String>) -> Self {
        let mut tags = spec.tags.clone();
        tags.extend(extra_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            protocol_type: "MCP".to_string(),
            authorizer_type: "CUSTOM_JWT".to_string(),
            authorizer_configuration: AuthorizerConfiguration {
                custom_jwt_authorizer: CustomJwtAuthorizer {
                    discovery_url: spec.auth.discovery_url.to_string(),
                    allowed_audience: spec.auth.audiences.clone(),
                },
            },
            role_arn: spec.role_arn.clone(),
            tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachTargetRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub target_configuration: TargetConfiguration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_provider_configurations: Vec<CredentialProviderConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfiguration {
    pub mcp: McpTargetConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum McpTargetConfiguration {
    Lambda { lambda_arn: String },
    OpenApiSchema { uri: String },
    SmithyModel { uri: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProviderConfiguration {
    pub credential_provider_type: String,
}

impl AttachTargetRequest {
    #[must_use]
    pub fn from_target(target: &GatewayTarget) -> Self {
        let (mcp, credential_provider_configurations) = match target.target_type {
            TargetType::Lambda => (
                McpTargetConfiguration::Lambda {
                    lambda_arn: target.function_reference.clone(),
                },
                vec![CredentialProviderConfiguration {
                    credential_provider_type: "GATEWAY_IAM_ROLE".to_string(),
                }],
            ),
            TargetType::OpenApi => (
                McpTargetConfiguration::OpenApiSchema {
                    uri: target.function_reference.clone(),
                },
                Vec::new(),
            ),
            TargetType::Smithy => (
                McpTargetConfiguration::SmithyModel {
                    uri: target.function_reference.clone(),
                },
                Vec::new(),
            ),
        };
        Self {
            name: target.name.clone(),
            description: target.description.clone(),
            target_configuration: TargetConfiguration { mcp },
            credential_provider_configurations,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServiceErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(rename = "__type", default)]
    type_: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

/// Control-plane client over HTTPS+JSON with bearer tokens from a [`TokenProvider`].
#[derive(Clone)]
pub struct HttpControlPlane {
    base: Url,
    http: reqwest::Client,
    tokens: TokenProvider,
    credential: Credential,
}

impl HttpControlPlane {
    #[must_use]
    pub fn new(
        mut base: Url,
        http: reqwest::Client,
        tokens: TokenProvider,
        credential: Credential,
    ) -> Self {
        // Relative joins replace the last segment unless the base ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            base,
            http,
            tokens,
            credential,
        }
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|e| {
            ApiError::new(
                ApiErrorKind::Rejected,
                format!("join control-plane base with path '{path}': {e}"),
            )
        })
    }

    async fn auth(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self.tokens.get_token(&self.credential).await?;
        Ok(req.header(
            reqwest::header::AUTHORIZATION,
            token.authorization_header(),
        ))
    }

    /// Send with a bearer token; a 401 drops the token and re-sends once with a new one.
    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let again = req.try_clone();
        match self.send_once(req, what).await {
            Err(err) if err.status == Some(401) => match again {
                Some(req) => {
                    tracing::debug!(what, "access token rejected, retrying with a new one");
                    self.send_once(req, what).await
                }
                None => Err(err),
            },
            other => other,
        }
    }

    async fn send_once(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let resp = self
            .auth(req)
            .await?
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let parsed: ServiceErrorBody = serde_json::from_str(&body).unwrap_or_default();
        // `__type` may be namespaced: `com.amazonaws.service#ConflictException`.
        let code = parsed
            .code
            .or(parsed.type_)
            .map(|c| c.rsplit('#').next().unwrap_or(&c).to_string());
        let message = match parsed.message {
            Some(m) => m,
            None if body.is_empty() => format!("{what} returned {status}"),
            None => body,
        };
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&self.credential).await;
        }
        Err(ApiError::from_status(status.as_u16(), code, message))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, ApiError> {
        self.send(req, what)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))
    }

    fn paged(&self, path: &str, page: &PageRequest) -> Result<Url, ApiError> {
        let mut url = self.url(path)?;
        {
            let mut q = url.query_pairs_mut();
            if page.max_results > 0 {
                q.append_pair("maxResults", &page.max_results.to_string());
            }
            if let Some(token) = &page.next_token {
                q.append_pair("nextToken", token);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_gateway(
        &self,
        req: &CreateGatewayRequest,
    ) -> Result<GatewayResource, ApiError> {
        let url = self.url("gateways")?;
        self.send_json(self.http.post(url).json(req), "POST /gateways")
            .await
    }

    async fn get_gateway(&self, gateway_id: &str) -> Result<GatewayResource, ApiError> {
        let url = self.url(&format!("gateways/{gateway_id}"))?;
        self.send_json(self.http.get(url), "GET /gateways/{id}").await
    }

    async fn list_gateways(&self, page: PageRequest) -> Result<Page<GatewayResource>, ApiError> {
        let url = self.paged("gateways", &page)?;
        self.send_json(self.http.get(url), "GET /gateways").await
    }

    async fn delete_gateway(&self, gateway_id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("gateways/{gateway_id}"))?;
        self.send(self.http.delete(url), "DELETE /gateways/{id}")
            .await?;
        Ok(())
    }

    async fn attach_target(
        &self,
        gateway_id: &str,
        req: &AttachTargetRequest,
    ) -> Result<TargetResource, ApiError> {
        let url = self.url(&format!("gateways/{gateway_id}/targets"))?;
        self.send_json(self.http.post(url).json(req), "POST /gateways/{id}/targets")
            .await
    }

    async fn get_target(
        &self,
        gateway_id: &str,
        target_id: &str,
    ) -> Result<TargetResource, ApiError> {
        let url = self.url(&format!("gateways/{gateway_id}/targets/{target_id}"))?;
        self.send_json(self.http.get(url), "GET /gateways/{id}/targets/{target_id}")
            .await
    }

    async fn list_targets(
        &self,
        gateway_id: &str,
        page: PageRequest,
    ) -> Result<Page<TargetResource>, ApiError> {
        let url = self.paged(&format!("gateways/{gateway_id}/targets"), &page)?;
        self.send_json(self.http.get(url), "GET /gateways/{id}/targets")
            .await
    }

    async fn detach_target(&self, gateway_id: &str, target_id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("gateways/{gateway_id}/targets/{target_id}"))?;
        self.send(
            self.http.delete(url),
            "DELETE /gateways/{id}/targets/{target_id}",
        )
        .await?;
        Ok(())
    }
}

/// Every target of a gateway, following `nextToken` until the last page.
pub(crate) async fn all_targets(
    api: &dyn ControlPlane,
    retrier: &Retrier,
    gateway_id: &str,
    page_size: u32,
) -> crate::Result<Vec<TargetResource>> {
    let mut out = Vec::new();
    let mut req = PageRequest::first(page_size);
    loop {
        let page = retrier
            .run("list targets", gateway_id, || {
                api.list_targets(gateway_id, req.clone())
            })
            .await?;
        out.extend(page.items);
        match page.next_token.filter(|t| !t.is_empty()) {
            Some(token) => req.next_token = Some(token),
            None => return Ok(out),
        }
    }
}
