use crate::api::{self, ControlPlane, PageRequest};
use crate::error::{Error, Result};
use crate::model::{GatewayResource, GatewayStatus, OwnershipTag, TargetResource};
use crate::poll::{PollBudget, PollSettings};
use crate::retry::Retrier;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;

/// Decides which gateways on the control plane belong to this tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipFilter {
    pub tag: OwnershipTag,
    /// Case-insensitive name fragments accepted for untagged gateways.
    pub name_contains: Vec<String>,
}

impl Default for OwnershipFilter {
    fn default() -> Self {
        Self {
            tag: OwnershipTag::default(),
            name_contains: vec!["mcp".to_string()],
        }
    }
}

impl OwnershipFilter {
    #[must_use]
    pub fn owns(&self, gw: &GatewayResource) -> bool {
        if self.tag.matches(&gw.tags) {
            return true;
        }
        let name = gw.name.to_lowercase();
        self.name_contains
            .iter()
            .filter(|f| !f.is_empty())
            .any(|f| name.contains(&f.to_lowercase()))
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub polling: PollSettings,
    pub page_size: u32,
    pub ownership: OwnershipFilter,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            polling: PollSettings::default(),
            page_size: 50,
            ownership: OwnershipFilter::default(),
        }
    }
}

/// Asks the operator before anything is deleted.
#[async_trait]
pub trait Confirm: Send + Sync {
    /// One gateway, with the targets that will be detached first.
    async fn confirm_gateway(&self, gateway: &GatewayResource, targets: &[TargetResource]) -> bool;

    /// A whole batch at once (full teardown).
    async fn confirm_batch(&self, gateways: &[GatewayResource]) -> bool;
}

/// Accepts everything; used when deletions are forced.
pub struct AlwaysConfirm;

#[async_trait]
impl Confirm for AlwaysConfirm {
    async fn confirm_gateway(&self, _: &GatewayResource, _: &[TargetResource]) -> bool {
        true
    }

    async fn confirm_batch(&self, _: &[GatewayResource]) -> bool {
        true
    }
}

/// How far the teardown of a gateway got before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionState {
    /// Nothing was deleted yet.
    Active,
    /// Targets were being detached.
    DetachingTargets,
    /// The delete request was sent (or was already in flight).
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "outcome",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum CleanupOutcome {
    Deleted { detached_targets: usize },
    /// The gateway did not exist (or was already DELETED); nothing to do.
    AlreadyAbsent,
    /// The operator declined.
    Skipped,
    Failed { state: DeletionState, error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupItem {
    pub gateway_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub outcome: CleanupOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub items: Vec<CleanupItem>,
}

impl CleanupReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.outcome, CleanupOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn all_failed(&self) -> bool {
        !self.items.is_empty()
            && self
                .items
                .iter()
                .all(|i| matches!(i.outcome, CleanupOutcome::Failed { .. }))
    }
}

/// A gateway together with its attached targets.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayDetails {
    pub gateway: GatewayResource,
    pub targets: Vec<TargetResource>,
}

/// Lists gateways owned by this tool and tears them down, dependents first.
pub struct ResourceReconciler {
    api: Arc<dyn ControlPlane>,
    retrier: Retrier,
    options: ReconcilerOptions,
    confirm: Arc<dyn Confirm>,
}

#[derive(Default)]
struct Progress {
    state: Option<DeletionState>,
    detached: usize,
}

impl ResourceReconciler {
    #[must_use]
    pub fn new(
        api: Arc<dyn ControlPlane>,
        retrier: Retrier,
        options: ReconcilerOptions,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            api,
            retrier,
            options,
            confirm,
        }
    }

    /// Owned gateways, fetched page by page as the stream is polled.
    ///
    /// Every call starts over from the first page.
    pub fn list(&self) -> BoxStream<'_, Result<GatewayResource>> {
        let ownership = &self.options.ownership;
        self.all_gateways()
            .try_filter(move |gw| futures::future::ready(ownership.owns(gw)))
            .boxed()
    }

    /// Every gateway visible to the credential, owned or not.
    pub fn list_all(&self) -> BoxStream<'_, Result<GatewayResource>> {
        self.all_gateways().boxed()
    }

    fn all_gateways(&self) -> impl futures::Stream<Item = Result<GatewayResource>> + Send + '_ {
        let first = Some(PageRequest::first(self.options.page_size));
        stream::try_unfold(first, move |next| async move {
            let Some(req) = next else {
                return Ok::<_, Error>(None);
            };
            let page = self
                .retrier
                .run("list gateways", "gateways", || {
                    self.api.list_gateways(req.clone())
                })
                .await?;
            tracing::debug!(
                count = page.items.len(),
                more = page.next_token.is_some(),
                "listed gateway page"
            );
            let next = page
                .next_token
                .filter(|t| !t.is_empty())
                .map(|token| PageRequest {
                    next_token: Some(token),
                    max_results: req.max_results,
                });
            let items = stream::iter(page.items.into_iter().map(Ok::<_, Error>));
            Ok(Some((items, next)))
        })
        .try_flatten()
    }

    /// One gateway and its targets.
    ///
    /// # Errors
    ///
    /// Unlike cleanup, a missing gateway is an `Error::NotFound` here.
    pub async fn info(&self, gateway_id: &str) -> Result<GatewayDetails> {
        let gateway = self
            .retrier
            .run("get gateway", gateway_id, || {
                self.api.get_gateway(gateway_id)
            })
            .await?;
        let targets = self.targets_of(gateway_id).await?;
        Ok(GatewayDetails { gateway, targets })
    }

    /// Delete the given gateways one after another, asking per gateway unless `force`.
    ///
    /// Missing gateways count as success. Failures are recorded per gateway.
    ///
    /// # Errors
    ///
    /// Only cancellation aborts the run.
    pub async fn cleanup(&self, gateway_ids: &[String], force: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for id in gateway_ids {
            let item = self.cleanup_one(id, !force).await?;
            report.items.push(item);
        }
        Ok(report)
    }

    /// Delete every owned gateway after a single batch confirmation unless `force`.
    ///
    /// # Errors
    ///
    /// Fails when the listing fails or the run is cancelled.
    pub async fn cleanup_owned(&self, force: bool) -> Result<CleanupReport> {
        let owned: Vec<GatewayResource> = self.list().try_collect().await?;
        if owned.is_empty() {
            tracing::info!("no owned gateways to clean up");
            return Ok(CleanupReport::default());
        }
        if !force && !self.confirm.confirm_batch(&owned).await {
            tracing::info!(count = owned.len(), "cleanup declined");
            return Ok(CleanupReport {
                items: owned
                    .into_iter()
                    .map(|gw| CleanupItem {
                        gateway_id: gw.id,
                        name: Some(gw.name),
                        outcome: CleanupOutcome::Skipped,
                    })
                    .collect(),
            });
        }

        let mut report = CleanupReport::default();
        for gw in owned {
            report.items.push(self.cleanup_one(&gw.id, false).await?);
        }
        Ok(report)
    }

    async fn cleanup_one(&self, gateway_id: &str, ask: bool) -> Result<CleanupItem> {
        let item = |name: Option<String>, outcome| CleanupItem {
            gateway_id: gateway_id.to_string(),
            name,
            outcome,
        };

        let gw = match self
            .retrier
            .run("get gateway", gateway_id, || {
                self.api.get_gateway(gateway_id)
            })
            .await
        {
            Ok(gw) => gw,
            Err(err) if err.is_not_found() => {
                tracing::info!(gateway_id, "gateway already absent");
                return Ok(item(None, CleanupOutcome::AlreadyAbsent));
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                return Ok(item(
                    None,
                    CleanupOutcome::Failed {
                        state: DeletionState::Active,
                        error: err.to_string(),
                    },
                ));
            }
        };
        let name = Some(gw.name.clone());
        if gw.status == GatewayStatus::Deleted {
            return Ok(item(name, CleanupOutcome::AlreadyAbsent));
        }

        let mut progress = Progress::default();
        match self.teardown(&gw, ask, &mut progress).await {
            Ok(true) => {
                tracing::info!(gateway_id, detached = progress.detached, "gateway deleted");
                Ok(item(
                    name,
                    CleanupOutcome::Deleted {
                        detached_targets: progress.detached,
                    },
                ))
            }
            Ok(false) => Ok(item(name, CleanupOutcome::Skipped)),
            Err(err) if err.is_cancelled() => Err(err),
            // Vanished while we were working on it.
            Err(err) if err.is_not_found() => {
                let outcome = match progress.state {
                    None | Some(DeletionState::Active) => CleanupOutcome::AlreadyAbsent,
                    Some(_) => CleanupOutcome::Deleted {
                        detached_targets: progress.detached,
                    },
                };
                Ok(item(name, outcome))
            }
            Err(err) => {
                let state = progress.state.unwrap_or(DeletionState::Active);
                tracing::warn!(gateway_id, ?state, error = %err, "gateway cleanup failed");
                Ok(item(
                    name,
                    CleanupOutcome::Failed {
                        state,
                        error: err.to_string(),
                    },
                ))
            }
        }
    }

    /// Returns `Ok(false)` when the operator declined.
    async fn teardown(
        &self,
        gw: &GatewayResource,
        ask: bool,
        progress: &mut Progress,
    ) -> Result<bool> {
        let gateway_id = gw.id.as_str();
        progress.state = Some(DeletionState::Active);

        if gw.status != GatewayStatus::Deleting {
            let targets = self.targets_of(gateway_id).await?;
            if ask && !self.confirm.confirm_gateway(gw, &targets).await {
                tracing::info!(gateway_id, "deletion declined");
                return Ok(false);
            }

            progress.state = Some(DeletionState::DetachingTargets);
            for target in &targets {
                self.detach(gateway_id, target).await?;
                progress.detached += 1;
            }

            progress.state = Some(DeletionState::Deleting);
            self.retrier
                .run("delete gateway", gateway_id, || {
                    self.api.delete_gateway(gateway_id)
                })
                .await?;
            tracing::info!(gateway_id, "delete request accepted");
        } else {
            tracing::info!(
                gateway_id,
                "gateway already deleting, waiting for it to disappear"
            );
            progress.state = Some(DeletionState::Deleting);
        }

        self.wait_gateway_gone(gateway_id).await?;
        Ok(true)
    }

    async fn detach(&self, gateway_id: &str, target: &TargetResource) -> Result<()> {
        let resource = format!("{gateway_id}/{}", target.id);
        match self
            .retrier
            .run("detach target", &resource, || {
                self.api.detach_target(gateway_id, &target.id)
            })
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        tracing::info!(gateway_id, target = %target.name, "target detach requested");

        let mut budget = self.budget("wait for target removal", &resource);
        loop {
            budget.check_cancelled()?;
            match self
                .retrier
                .run("get target status", &resource, || {
                    self.api.get_target(gateway_id, &target.id)
                })
                .await
            {
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
                Ok(t) => {
                    tracing::debug!(
                        gateway_id,
                        target = %t.name,
                        status = %t.status,
                        "target still present"
                    );
                }
            }
            budget.wait().await?;
        }
    }

    async fn wait_gateway_gone(&self, gateway_id: &str) -> Result<()> {
        let mut budget = self.budget("wait for gateway deletion", gateway_id);
        loop {
            budget.check_cancelled()?;
            match self
                .retrier
                .run("get gateway status", gateway_id, || {
                    self.api.get_gateway(gateway_id)
                })
                .await
            {
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
                Ok(gw) if gw.status == GatewayStatus::Deleted => return Ok(()),
                Ok(gw) if gw.status.is_failed() => {
                    return Err(Error::GatewayFailed {
                        resource: gateway_id.to_string(),
                        reason: (!gw.status_reasons.is_empty())
                            .then(|| gw.status_reasons.join("; ")),
                    });
                }
                Ok(gw) => tracing::debug!(gateway_id, status = %gw.status, "gateway still present"),
            }
            budget.wait().await?;
        }
    }

    async fn targets_of(&self, gateway_id: &str) -> Result<Vec<TargetResource>> {
        api::all_targets(
            self.api.as_ref(),
            &self.retrier,
            gateway_id,
            self.options.page_size,
        )
        .await
    }

    fn budget(&self, step: &'static str, resource: &str) -> PollBudget {
        PollBudget::start(
            step,
            resource,
            self.options.polling,
            self.retrier.clock().clone(),
            self.retrier.cancel_token().clone(),
        )
    }
}
