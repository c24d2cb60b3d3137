//! Client-side reconciliation for managed MCP gateways.
//!
//! [`TokenProvider`] obtains OAuth2 client-credentials tokens, [`GatewayRegistrar`]
//! creates a gateway and attaches its targets, and [`ResourceReconciler`] lists and
//! tears down gateways owned by this tool. All three talk to the control plane
//! through the [`ControlPlane`] trait and share one [`Retrier`].

pub mod api;
pub mod clock;
pub mod config;
mod deployment;
pub mod error;
pub mod mcp;
pub mod model;
pub mod poll;
pub mod reconciler;
pub mod registrar;
pub mod retry;
pub mod token;

#[cfg(test)]
mod testing;

pub use api::{ControlPlane, HttpControlPlane};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Overrides, Settings};
pub use deployment::Deployment;
pub use error::{ApiError, ApiErrorKind, AuthError, Error, Result, ValidationErrors};
pub use mcp::{McpError, McpToolClient};
pub use reconciler::{
    AlwaysConfirm, CleanupOutcome, CleanupReport, Confirm, GatewayDetails, ResourceReconciler,
};
pub use registrar::{GatewayRegistrar, Registration, TargetOutcome};
pub use retry::{Retrier, RetryPolicy};
pub use token::TokenProvider;
