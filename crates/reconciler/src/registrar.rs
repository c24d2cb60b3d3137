use crate::api::{self, AttachTargetRequest, ControlPlane, CreateGatewayRequest, PageRequest};
use crate::error::{Error, Result};
use crate::model::{
    GatewayResource, GatewaySpec, GatewayStatus, GatewayTarget, OwnershipTag, TargetResource,
    TargetStatus,
};
use crate::poll::{PollBudget, PollSettings};
use crate::retry::Retrier;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RegistrarOptions {
    pub polling: PollSettings,
    /// Upper bound on target attachments in flight at once.
    pub attach_concurrency: usize,
    pub page_size: u32,
    /// Service error codes meaning "a gateway with this name already exists".
    pub duplicate_name_codes: Vec<String>,
    pub ownership_tag: OwnershipTag,
}

impl Default for RegistrarOptions {
    fn default() -> Self {
        Self {
            polling: PollSettings::default(),
            attach_concurrency: 4,
            page_size: 50,
            duplicate_name_codes: vec!["ConflictException".to_string()],
            ownership_tag: OwnershipTag::default(),
        }
    }
}

/// Result of one `create_gateway` run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub gateway: GatewayResource,
    /// The name was already taken and the existing gateway was adopted.
    pub reused_existing: bool,
    /// One entry per spec target, in spec order.
    pub targets: Vec<TargetReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    pub target_name: String,
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "outcome",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum TargetOutcome {
    Attached { target_id: String },
    AlreadyAttached { target_id: String },
    Failed { error: String },
}

impl TargetOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl Registration {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.targets.iter().any(|t| t.outcome.is_failed())
    }

    /// True when there was at least one target and none of them made it.
    #[must_use]
    pub fn all_failed(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| t.outcome.is_failed())
    }
}

/// Creates a gateway, waits for it to become ACTIVE and attaches its targets.
pub struct GatewayRegistrar {
    api: Arc<dyn ControlPlane>,
    retrier: Retrier,
    options: RegistrarOptions,
}

impl GatewayRegistrar {
    #[must_use]
    pub fn new(api: Arc<dyn ControlPlane>, retrier: Retrier, options: RegistrarOptions) -> Self {
        Self {
            api,
            retrier,
            options,
        }
    }

    /// Create (or adopt) the gateway described by `spec` and attach every target.
    ///
    /// Target failures are reported per target in the returned [`Registration`].
    ///
    /// # Errors
    ///
    /// Fails when the create request fails, when the gateway ends up FAILED or
    /// being deleted, when it does not become ACTIVE within the polling budget
    /// (the gateway is left in place), or when the run is cancelled.
    pub async fn create_gateway(&self, spec: &GatewaySpec) -> Result<Registration> {
        let (created, reused_existing) = self.submit(spec).await?;
        tracing::info!(
            gateway_id = %created.id,
            name = %created.name,
            status = %created.status,
            reused_existing,
            "gateway create request accepted"
        );
        reject_unusable("create gateway", &created)?;

        let gateway = self.wait_until_active(&created.id).await?;
        tracing::info!(gateway_id = %gateway.id, "gateway is active");

        let targets = self.attach_targets(&gateway.id, &spec.targets).await?;
        Ok(Registration {
            gateway,
            reused_existing,
            targets,
        })
    }

    async fn submit(&self, spec: &GatewaySpec) -> Result<(GatewayResource, bool)> {
        let req = CreateGatewayRequest::from_spec(spec, &self.options.ownership_tag.as_tags());
        let err = match self
            .retrier
            .run("create gateway", &spec.name, || {
                self.api.create_gateway(&req)
            })
            .await
        {
            Ok(gw) => return Ok((gw, false)),
            Err(err) => err,
        };

        let duplicate = err
            .service_code()
            .is_some_and(|code| self.options.duplicate_name_codes.iter().any(|c| c == code));
        if !duplicate {
            return Err(err);
        }
        tracing::info!(
            name = %spec.name,
            "gateway name already taken, looking up existing gateway"
        );
        match self.find_by_name(&spec.name).await? {
            Some(existing) => Ok((existing, true)),
            None => Err(err),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<GatewayResource>> {
        let mut req = PageRequest::first(self.options.page_size);
        loop {
            let page = self
                .retrier
                .run("list gateways", name, || {
                    self.api.list_gateways(req.clone())
                })
                .await?;
            if let Some(found) = page.items.into_iter().find(|g| g.name == name) {
                return Ok(Some(found));
            }
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => req.next_token = Some(token),
                None => return Ok(None),
            }
        }
    }

    async fn wait_until_active(&self, gateway_id: &str) -> Result<GatewayResource> {
        let mut budget = self.budget("wait for gateway", gateway_id);
        loop {
            budget.check_cancelled()?;
            let gw = self
                .retrier
                .run("get gateway status", gateway_id, || {
                    self.api.get_gateway(gateway_id)
                })
                .await?;
            if gw.status == GatewayStatus::Active {
                tracing::debug!(
                    gateway_id,
                    checks = budget.waits() + 1,
                    elapsed_ms = u64::try_from(budget.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "gateway reached ACTIVE"
                );
                return Ok(gw);
            }
            reject_unusable("wait for gateway", &gw)?;
            tracing::debug!(gateway_id, status = %gw.status, "gateway not active yet");
            budget.wait().await?;
        }
    }

    async fn attach_targets(
        &self,
        gateway_id: &str,
        targets: &[GatewayTarget],
    ) -> Result<Vec<TargetReport>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let listed = api::all_targets(
            self.api.as_ref(),
            &self.retrier,
            gateway_id,
            self.options.page_size,
        )
        .await;
        let existing: HashMap<String, TargetResource> = match listed {
            Ok(found) => found.into_iter().map(|t| (t.name.clone(), t)).collect(),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                // Attach everything; a duplicate then fails per target.
                tracing::warn!(gateway_id, error = %err, "could not list existing targets");
                HashMap::new()
            }
        };

        let existing = &existing;
        let results: Vec<Result<TargetOutcome>> = futures::stream::iter(targets)
            .map(|target| async move {
                if let Some(found) = existing.get(&target.name) {
                    tracing::info!(gateway_id, target = %target.name, "target already attached");
                    return Ok(TargetOutcome::AlreadyAttached {
                        target_id: found.id.clone(),
                    });
                }
                self.attach_one(gateway_id, target).await
            })
            .buffered(self.options.attach_concurrency.max(1))
            .collect()
            .await;

        let mut reports = Vec::with_capacity(targets.len());
        for (target, result) in targets.iter().zip(results) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        gateway_id,
                        target = %target.name,
                        error = %err,
                        "target attachment failed"
                    );
                    TargetOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            reports.push(TargetReport {
                target_name: target.name.clone(),
                outcome,
            });
        }
        Ok(reports)
    }

    async fn attach_one(&self, gateway_id: &str, target: &GatewayTarget) -> Result<TargetOutcome> {
        let resource = format!("{gateway_id}/{}", target.name);
        let req = AttachTargetRequest::from_target(target);
        let created = self
            .retrier
            .run("attach target", &resource, || {
                self.api.attach_target(gateway_id, &req)
            })
            .await?;

        let mut current = created;
        let mut budget = self.budget("wait for target", &resource);
        loop {
            match current.status {
                TargetStatus::Ready => break,
                TargetStatus::Failed | TargetStatus::UpdateUnsuccessful => {
                    return Err(Error::Rejected {
                        step: "wait for target",
                        resource,
                        status: None,
                        code: None,
                        message: format!("target reached {}", current.status),
                    });
                }
                _ => {}
            }
            budget.wait().await?;
            let next = self
                .retrier
                .run("get target status", &resource, || {
                    self.api.get_target(gateway_id, &current.id)
                })
                .await?;
            current = next;
        }
        tracing::info!(
            gateway_id,
            target = %target.name,
            target_id = %current.id,
            "target attached"
        );
        Ok(TargetOutcome::Attached {
            target_id: current.id,
        })
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

/// A gateway being torn down or in a failed state cannot be registered against.
fn reject_unusable(step: &'static str, gw: &GatewayResource) -> Result<()> {
    if gw.status.is_failed() {
        return Err(Error::GatewayFailed {
            resource: gw.id.clone(),
            reason: (!gw.status_reasons.is_empty()).then(|| gw.status_reasons.join("; ")),
        });
    }
    if gw.status.is_going_away() {
        return Err(Error::Rejected {
            step,
            resource: gw.id.clone(),
            status: None,
            code: None,
            message: format!("gateway is {}", gw.status),
        });
    }
    Ok(())
}
