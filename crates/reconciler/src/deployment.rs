use crate::api::{ControlPlane, HttpControlPlane};
use crate::clock::Clock;
use crate::config::Settings;
use crate::mcp::{McpError, McpToolClient};
use crate::reconciler::{Confirm, ResourceReconciler};
use crate::registrar::GatewayRegistrar;
use crate::retry::Retrier;
use crate::token::TokenProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything one invocation needs, built once from validated [`Settings`].
///
/// The token cache, HTTP client and retry policy are shared by every component
/// handed out from here.
pub struct Deployment {
    settings: Settings,
    http: reqwest::Client,
    tokens: TokenProvider,
    api: Arc<dyn ControlPlane>,
    retrier: Retrier,
}

impl Deployment {
    #[must_use]
    pub fn new(
        settings: Settings,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let tokens = TokenProvider::new(http.clone(), clock.clone(), settings.token_skew);
        let api: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
            settings.control_plane_endpoint.clone(),
            http.clone(),
            tokens.clone(),
            settings.credential.clone(),
        ));
        let retrier = Retrier::new(settings.retry.clone(), clock, cancel);
        Self {
            settings,
            http,
            tokens,
            api,
            retrier,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn control_plane(&self) -> Arc<dyn ControlPlane> {
        self.api.clone()
    }

    #[must_use]
    pub fn registrar(&self) -> GatewayRegistrar {
        GatewayRegistrar::new(
            self.api.clone(),
            self.retrier.clone(),
            self.settings.registrar_options(),
        )
    }

    #[must_use]
    pub fn reconciler(&self, confirm: Arc<dyn Confirm>) -> ResourceReconciler {
        ResourceReconciler::new(
            self.api.clone(),
            self.retrier.clone(),
            self.settings.reconciler_options(),
            confirm,
        )
    }

    /// Open an MCP session against `gateway_url` with this deployment's credential.
    ///
    /// # Errors
    ///
    /// See [`McpToolClient::connect`].
    pub async fn mcp_client(&self, gateway_url: &str) -> Result<McpToolClient, McpError> {
        McpToolClient::connect(
            self.http.clone(),
            gateway_url,
            self.tokens.clone(),
            self.settings.credential.clone(),
        )
        .await
    }
}
