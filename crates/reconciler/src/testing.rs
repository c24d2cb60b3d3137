//! Scripted in-memory control plane used by unit tests.

use crate::api::{AttachTargetRequest, ControlPlane, CreateGatewayRequest, Page, PageRequest};
use crate::clock::ManualClock;
use crate::error::ApiError;
use crate::model::{GatewayResource, GatewayStatus, TargetResource, TargetStatus};
use crate::retry::{Retrier, RetryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) fn retrier(clock: &ManualClock) -> Retrier {
    cancellable_retrier(clock, &CancellationToken::new())
}

pub(crate) fn cancellable_retrier(clock: &ManualClock, cancel: &CancellationToken) -> Retrier {
    Retrier::new(
        RetryPolicy::default(),
        Arc::new(clock.clone()),
        cancel.clone(),
    )
}

#[derive(Default)]
pub(crate) struct FakeControlPlane {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    gateways: BTreeMap<String, FakeGateway>,
    next_id: u32,
    calls: Vec<String>,
    creating_checks: u32,
    deleting_checks: u32,
    ready_status: Option<GatewayStatus>,
    duplicate_code: Option<String>,
    failing_targets: HashSet<String>,
    stalled_targets: HashSet<String>,
    cancel_on: Option<(&'static str, CancellationToken)>,
    transient: HashMap<&'static str, u32>,
    page_size: Option<usize>,
}

struct FakeGateway {
    resource: GatewayResource,
    targets: Vec<TargetResource>,
    creating_left: u32,
    deleting_left: Option<u32>,
}

impl FakeControlPlane {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Gateways report CREATING for this many status checks before becoming ready.
    pub(crate) fn creating_checks(self, n: u32) -> Self {
        self.state.lock().creating_checks = n;
        self
    }

    /// After a delete request, gateways report DELETING for this many checks before vanishing.
    pub(crate) fn deleting_checks(self, n: u32) -> Self {
        self.state.lock().deleting_checks = n;
        self
    }

    /// Status reported once the CREATING phase is over (ACTIVE by default).
    pub(crate) fn ready_status(self, status: GatewayStatus) -> Self {
        self.state.lock().ready_status = Some(status);
        self
    }

    /// Reject creation of an already-used name with HTTP 409 and this service code.
    pub(crate) fn duplicate_code(self, code: &str) -> Self {
        self.state.lock().duplicate_code = Some(code.to_string());
        self
    }

    pub(crate) fn failing_target(self, name: &str) -> Self {
        self.state.lock().failing_targets.insert(name.to_string());
        self
    }

    /// Targets with this name are accepted but stay CREATING.
    pub(crate) fn stalled_target(self, name: &str) -> Self {
        self.state.lock().stalled_targets.insert(name.to_string());
        self
    }

    /// Fire `token` when `op` is called; the call itself still succeeds.
    pub(crate) fn cancel_on(self, op: &'static str, token: &CancellationToken) -> Self {
        self.state.lock().cancel_on = Some((op, token.clone()));
        self
    }

    /// Fail the next `n` calls of `op` with a transient error.
    pub(crate) fn transient(self, op: &'static str, n: u32) -> Self {
        self.state.lock().transient.insert(op, n);
        self
    }

    pub(crate) fn page_size(self, n: usize) -> Self {
        self.state.lock().page_size = Some(n);
        self
    }

    pub(crate) fn seed_gateway(
        &self,
        name: &str,
        status: GatewayStatus,
        tags: &[(&str, &str)],
        targets: &[&str],
    ) -> String {
        let mut st = self.state.lock();
        st.next_id += 1;
        let id = format!("gw-{}", st.next_id);
        let mut fake = FakeGateway {
            resource: GatewayResource {
                id: id.clone(),
                name: name.to_string(),
                status,
                created_at: None,
                gateway_url: Some(format!("https://{id}.gateway.example.com/mcp")),
                status_reasons: Vec::new(),
                tags: tags
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            },
            targets: Vec::new(),
            creating_left: 0,
            deleting_left: (status == GatewayStatus::Deleting).then_some(st.deleting_checks),
        };
        for t in targets {
            st.next_id += 1;
            fake.targets.push(TargetResource {
                id: format!("tgt-{}", st.next_id),
                name: (*t).to_string(),
                status: TargetStatus::Ready,
            });
        }
        st.gateways.insert(id.clone(), fake);
        id
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| *c == op || c.starts_with(&prefix))
            .count()
    }

    pub(crate) fn gateway_count(&self) -> usize {
        self.state.lock().gateways.len()
    }

    pub(crate) fn target_names(&self, gateway_id: &str) -> Vec<String> {
        self.state
            .lock()
            .gateways
            .get(gateway_id)
            .map(|g| g.targets.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl State {
    fn enter(&mut self, op: &'static str, call: String) -> Result<(), ApiError> {
        self.calls.push(call);
        if let Some((on, token)) = &self.cancel_on
            && *on == op
        {
            token.cancel();
        }
        if let Some(left) = self.transient.get_mut(op)
            && *left > 0
        {
            *left -= 1;
            let err = ApiError::transient(format!("{op}: service unavailable"));
            return Err(err.with_status(503));
        }
        Ok(())
    }

    fn page<T: Clone>(&self, all: &[T], page: &PageRequest) -> Page<T> {
        let start: usize = page
            .next_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let size = self
            .page_size
            .unwrap_or(usize::try_from(page.max_results).unwrap_or(usize::MAX))
            .max(1);
        let end = (start + size).min(all.len());
        Page {
            items: all[start.min(end)..end].to_vec(),
            next_token: (end < all.len()).then(|| end.to_string()),
        }
    }

    fn gateway(&mut self, id: &str) -> Result<&mut FakeGateway, ApiError> {
        self.gateways
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("gateway {id} not found")).with_status(404))
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_gateway(
        &self,
        req: &CreateGatewayRequest,
    ) -> Result<GatewayResource, ApiError> {
        let mut st = self.state.lock();
        st.enter("create_gateway", format!("create_gateway:{}", req.name))?;
        if st.gateways.values().any(|g| g.resource.name == req.name)
            && let Some(code) = st.duplicate_code.clone()
        {
            let err = ApiError::rejected(code, "gateway name already exists");
            return Err(err.with_status(409));
        }
        st.next_id += 1;
        let id = format!("gw-{}", st.next_id);
        let resource = GatewayResource {
            id: id.clone(),
            name: req.name.clone(),
            status: GatewayStatus::Creating,
            created_at: None,
            gateway_url: Some(format!("https://{id}.gateway.example.com/mcp")),
            status_reasons: Vec::new(),
            tags: req.tags.clone(),
        };
        let creating_left = st.creating_checks;
        st.gateways.insert(
            id,
            FakeGateway {
                resource: resource.clone(),
                targets: Vec::new(),
                creating_left,
                deleting_left: None,
            },
        );
        Ok(resource)
    }

    async fn get_gateway(&self, gateway_id: &str) -> Result<GatewayResource, ApiError> {
        let mut st = self.state.lock();
        st.enter("get_gateway", format!("get_gateway:{gateway_id}"))?;
        let ready = st.ready_status.unwrap_or(GatewayStatus::Active);
        let gw = st.gateway(gateway_id)?;
        if let Some(left) = gw.deleting_left {
            if left == 0 {
                st.gateways.remove(gateway_id);
                return Err(ApiError::not_found("gateway deleted").with_status(404));
            }
            gw.deleting_left = Some(left - 1);
            gw.resource.status = GatewayStatus::Deleting;
        } else if gw.creating_left > 0 {
            gw.creating_left -= 1;
            gw.resource.status = GatewayStatus::Creating;
        } else if gw.resource.status == GatewayStatus::Creating {
            gw.resource.status = ready;
        }
        Ok(gw.resource.clone())
    }

    async fn list_gateways(&self, page: PageRequest) -> Result<Page<GatewayResource>, ApiError> {
        let mut st = self.state.lock();
        st.enter("list_gateways", "list_gateways".to_string())?;
        let all: Vec<GatewayResource> = st.gateways.values().map(|g| g.resource.clone()).collect();
        Ok(st.page(&all, &page))
    }

    async fn delete_gateway(&self, gateway_id: &str) -> Result<(), ApiError> {
        let mut st = self.state.lock();
        st.enter("delete_gateway", format!("delete_gateway:{gateway_id}"))?;
        let deleting = st.deleting_checks;
        let gw = st.gateway(gateway_id)?;
        if !gw.targets.is_empty() {
            return Err(ApiError::rejected(
                "ConflictException",
                "gateway still has targets attached",
            )
            .with_status(409));
        }
        gw.deleting_left = Some(deleting);
        gw.resource.status = GatewayStatus::Deleting;
        Ok(())
    }

    async fn attach_target(
        &self,
        gateway_id: &str,
        req: &AttachTargetRequest,
    ) -> Result<TargetResource, ApiError> {
        let mut st = self.state.lock();
        st.enter(
            "attach_target",
            format!("attach_target:{gateway_id}:{}", req.name),
        )?;
        if st.failing_targets.contains(&req.name) {
            return Err(
                ApiError::rejected("ValidationException", "function reference is not invocable")
                    .with_status(400),
            );
        }
        st.next_id += 1;
        let status = if st.stalled_targets.contains(&req.name) {
            TargetStatus::Creating
        } else {
            TargetStatus::Ready
        };
        let target = TargetResource {
            id: format!("tgt-{}", st.next_id),
            name: req.name.clone(),
            status,
        };
        st.gateway(gateway_id)?.targets.push(target.clone());
        Ok(target)
    }

    async fn get_target(
        &self,
        gateway_id: &str,
        target_id: &str,
    ) -> Result<TargetResource, ApiError> {
        let mut st = self.state.lock();
        st.enter("get_target", format!("get_target:{gateway_id}:{target_id}"))?;
        st.gateway(gateway_id)?
            .targets
            .iter()
            .find(|t| t.id == target_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("target not found").with_status(404))
    }

    async fn list_targets(
        &self,
        gateway_id: &str,
        page: PageRequest,
    ) -> Result<Page<TargetResource>, ApiError> {
        let mut st = self.state.lock();
        st.enter("list_targets", format!("list_targets:{gateway_id}"))?;
        let all = st.gateway(gateway_id)?.targets.clone();
        Ok(st.page(&all, &page))
    }

    async fn detach_target(&self, gateway_id: &str, target_id: &str) -> Result<(), ApiError> {
        let mut st = self.state.lock();
        st.enter(
            "detach_target",
            format!("detach_target:{gateway_id}:{target_id}"),
        )?;
        let gw = st.gateway(gateway_id)?;
        let before = gw.targets.len();
        gw.targets.retain(|t| t.id != target_id);
        if gw.targets.len() == before {
            return Err(ApiError::not_found("target not found").with_status(404));
        }
        Ok(())
    }
}
