//! Remediation reconciler
//!
//! Drives one RemediationRequest through the fencing lifecycle. Every
//! invocation recomputes the next step purely from observed cluster state,
//! so the reconciler is idempotent; a single status write is deferred to
//! the end of each invocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        controller::{Action, Controller},
        events::Recorder,
        watcher,
    },
    Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{RemediationPhase, RemediationRequest, RemediationStrategy};
use crate::error::{is_conflict, is_not_found, Error, Result};
use crate::reboot::{Rebooter, TIME_TO_ASSUME_REBOOT_HAS_STARTED};
use crate::utils::linux_uptime;

use super::conditions::{update_conditions, ProcessingChangeReason};
use super::events::{self, normal_event};
use super::finalizers;
use super::resources;
use super::taints;

/// Grace period beyond the assumed-reboot time for the out-of-service
/// eviction to finish. The cluster controls that eviction, so a timer bounds
/// how long we wait before falling back to exponential back-off.
pub const OUT_OF_SERVICE_GRACE: Duration = Duration::from_secs(300);

const OUT_OF_SERVICE_POLL: Duration = Duration::from_secs(5);
const STATUS_CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

const RETRIABLE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RETRIABLE_BACKOFF_MAX: Duration = Duration::from_secs(300);
const TERMINAL_BACKOFF_BASE: Duration = Duration::from_secs(60);
const TERMINAL_BACKOFF_MAX: Duration = Duration::from_secs(600);

/// Consecutive-failure counts per request, driving exponential back-off.
///
/// The work queue itself retries at whatever delay `error_policy` returns,
/// so the growth across repeated failures of the same request has to be
/// tracked here. Counts are keyed by request UID and cleared on the first
/// clean reconciliation.
#[derive(Default)]
pub struct BackoffTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next retry of `key`, doubling from `base` up to
    /// `max`
    pub(crate) fn next_delay(&self, key: &str, base: Duration, max: Duration) -> Duration {
        let mut counts = self.lock();
        let attempts = counts.entry(key.to_string()).or_insert(0);
        let factor = 1u32 << (*attempts).min(16);
        *attempts = attempts.saturating_add(1);
        base.saturating_mul(factor).min(max)
    }

    pub(crate) fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Whether this process handles every request or only its own node's
#[derive(Clone, Debug)]
pub enum OperatorMode {
    /// Reconciles requests for all nodes, never reboots
    Manager,
    /// Scoped to one node; owns the reboot path for that node
    Agent { node_name: String },
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub recorder: Recorder,
    pub mode: OperatorMode,
    /// Present only in agent mode on reboot-capable nodes
    pub rebooter: Option<Arc<dyn Rebooter>>,
    /// How long peers must wait before assuming this node rebooted
    pub safe_reboot_timeout: Duration,
    pub out_of_service_taint_supported: bool,
    pub backoff: BackoffTracker,
}

impl ControllerState {
    fn is_agent(&self) -> bool {
        matches!(self.mode, OperatorMode::Agent { .. })
    }
}

/// Main entry point to start the remediation controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let requests: Api<RemediationRequest> = Api::all(client.clone());

    info!("starting RemediationRequest controller");

    // Verify the CRD exists before watching
    if let Err(e) = requests.list(&Default::default()).await {
        error!(
            "RemediationRequest CRD not found, install the CRDs first: {:?}",
            e
        );
        return Err(Error::ConfigError(
            "RemediationRequest CRD not installed".to_string(),
        ));
    }

    Controller::new(requests, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("reconciled: {:?}", obj),
                Err(e) => warn!("reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
async fn reconcile(request: Arc<RemediationRequest>, ctx: Arc<ControllerState>) -> Result<Action> {
    if let OperatorMode::Agent { node_name } = &ctx.mode {
        if request.name_any() != *node_name {
            debug!("request belongs to a different node, skipping");
            return Ok(Action::await_change());
        }
        info!("agent starting remediation on owned node");
    }

    let namespace = request.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<RemediationRequest> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut updated = (*request).clone();
    let outcome = reconcile_inner(&ctx, &api, &mut updated).await;

    // Record the most recent error on status; cleared on a clean pass
    match &outcome {
        Err(err) => updated.status_mut().last_error = Some(err.to_string()),
        Ok(_) => {
            if let Some(status) = updated.status.as_mut() {
                status.last_error = None;
            }
        }
    }

    // Deferred single status write; a conflict maps to a short requeue
    // rather than an error, preserving the phase invariants
    let conflicted = match flush_status(&api, &request, &updated).await {
        Ok(()) => false,
        Err(Error::KubeError(err)) if is_conflict(&err) => true,
        Err(err) => return Err(err),
    };

    let backoff_key = request.uid().unwrap_or_else(|| request.name_any());
    match outcome {
        Ok(_) if conflicted => {
            ctx.backoff.reset(&backoff_key);
            Ok(Action::requeue(STATUS_CONFLICT_REQUEUE))
        }
        Ok(action) => {
            ctx.backoff.reset(&backoff_key);
            Ok(action)
        }
        Err(Error::Unreconcilable(msg)) => {
            // Returning success on purpose: the error is recorded on the
            // status and retrying can never fix it, so the work queue must
            // not spin on this request.
            ctx.backoff.reset(&backoff_key);
            warn!(%msg, "remediation cannot proceed, giving up");
            Ok(Action::await_change())
        }
        Err(err) => Err(err),
    }
}

async fn reconcile_inner(
    ctx: &ControllerState,
    api: &Api<RemediationRequest>,
    request: &mut RemediationRequest,
) -> Result<Action> {
    if is_stopped_by_detector(request) {
        info!("health detector timed out, stopping remediation");
        normal_event(
            &ctx.recorder,
            request,
            events::REASON_REMEDIATION_STOPPED,
            "Remediation stopped: the health detector gave up waiting for fencing",
        )
        .await;
        update_conditions(
            &mut request.status_mut().conditions,
            ProcessingChangeReason::TimeoutByNHC,
        );
        finalizers::remove_finalizer(api, request).await?;
        return Ok(Action::await_change());
    }

    if request.phase() != RemediationPhase::FencingCompleted {
        update_conditions(
            &mut request.status_mut().conditions,
            ProcessingChangeReason::RemediationStarted,
        );
    }

    let node = match get_node_for_request(&ctx.client, request).await {
        Ok(node) => node,
        Err(Error::KubeError(err)) if is_not_found(&err) => {
            info!("no node matches this remediation request");
            update_conditions(
                &mut request.status_mut().conditions,
                ProcessingChangeReason::SkippedNodeNotFound,
            );
            normal_event(
                &ctx.recorder,
                request,
                events::REASON_REMEDIATION_SKIPPED,
                "Remediation skipped: target node not found",
            )
            .await;
            return Err(Error::Unreconcilable(format!(
                "no node found for remediation request {}",
                request.name_any()
            )));
        }
        Err(err) => return Err(err),
    };

    if node_excluded(&node) {
        info!(node = %node.name_any(), "node is excluded from remediation");
        normal_event(
            &ctx.recorder,
            &node,
            events::REASON_REMEDIATION_SKIPPED,
            "Remediation skipped: node is excluded from remediation",
        )
        .await;
        return Ok(Action::await_change());
    }

    // The missing finalizer doubles as "we have not started yet", which
    // keeps the start event from being emitted on every pass
    if !finalizers::has_finalizer(request) {
        let note = if ctx.is_agent() {
            "Remediation started by the fencing agent"
        } else {
            "Remediation started by the fencing manager"
        };
        normal_event(&ctx.recorder, request, events::REASON_REMEDIATION_STARTED, note).await;
    }

    let strategy = runtime_strategy(request.spec.strategy, ctx.out_of_service_taint_supported);

    match request.phase() {
        RemediationPhase::FencingStarted => prepare_reboot(ctx, api, request, &node).await,
        RemediationPhase::PreRebootCompleted => reboot_node(ctx, request, &node).await,
        RemediationPhase::RebootCompleted => {
            remove_node_resources(ctx, request, &node, strategy).await
        }
        RemediationPhase::FencingCompleted => restore_node(ctx, api, request, &node).await,
    }
}

/// Fencing-Started: finalizer, taints, unschedulable, assumed-reboot time
async fn prepare_reboot(
    ctx: &ControllerState,
    api: &Api<RemediationRequest>,
    request: &mut RemediationRequest,
    node: &Node,
) -> Result<Action> {
    info!("pre-reboot not completed yet, preparing to fence");

    if !is_node_reboot_capable(ctx, node).await {
        // We never delete workloads from a node we cannot guarantee reboots
        return Err(Error::RemediationError(
            "node is not capable of rebooting itself".to_string(),
        ));
    }

    if !finalizers::has_finalizer(request) {
        if finalizers::is_being_deleted(request) {
            info!("request deleted before remediation started, nothing to do");
            return Ok(Action::await_change());
        }
        finalizers::add_finalizer(api, request).await?;
        normal_event(
            &ctx.recorder,
            request,
            events::REASON_ADD_FINALIZER,
            "Remediation process: finalizer added",
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    add_no_execute_taint(ctx, node).await?;

    let node_taints = node_taints(node);
    let unschedulable = is_unschedulable(node);
    if !unschedulable || !taints::taint_exists(&node_taints, &taints::unschedulable_taint()) {
        return mark_unschedulable(ctx, node, unschedulable).await;
    }

    if request.time_assumed_rebooted().is_none() {
        let deadline = Utc::now()
            + chrono::Duration::from_std(ctx.safe_reboot_timeout)
                .map_err(|e| Error::ConfigError(format!("safe reboot timeout overflow: {e}")))?;
        request.status_mut().time_assumed_rebooted = Some(deadline.to_rfc3339());
        info!(deadline = %deadline, "assumed-reboot time set");
        normal_event(
            &ctx.recorder,
            request,
            events::REASON_UPDATE_TIME_ASSUMED_REBOOTED,
            "Remediation process: assumed-reboot time recorded on the request",
        )
        .await;
    }

    request.set_phase(RemediationPhase::PreRebootCompleted);
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Pre-Reboot-Completed: the owned node reboots itself, everyone else waits
/// for the assumed-reboot time on the wall clock
async fn reboot_node(
    ctx: &ControllerState,
    request: &mut RemediationRequest,
    node: &Node,
) -> Result<Action> {
    if let OperatorMode::Agent { node_name } = &ctx.mode {
        if *node_name == node.name_any() {
            return reboot_if_needed(ctx, request, node).await;
        }
    }

    let (rebooted, time_left) = was_node_rebooted(request.time_assumed_rebooted(), Utc::now());
    if !rebooted {
        debug!(?time_left, "waiting for the assumed-reboot time");
        return Ok(Action::requeue(time_left));
    }

    info!(node = %node.name_any(), "assumed-reboot time has passed, treating node as rebooted");
    request.set_phase(RemediationPhase::RebootCompleted);
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Reboot the local node unless this process already came back from one
/// within the lifetime of the request
async fn reboot_if_needed(
    ctx: &ControllerState,
    request: &RemediationRequest,
    node: &Node,
) -> Result<Action> {
    let uptime =
        linux_uptime().map_err(|e| Error::RemediationError(format!("uptime unavailable: {e}")))?;
    let created_at = request
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    if already_rebooted(uptime, created_at, Utc::now()) {
        info!("node already rebooted within this request's lifetime, skipping reboot");
        return Ok(Action::await_change());
    }

    let rebooter = ctx.rebooter.as_ref().ok_or_else(|| {
        Error::RebootError("no reboot mechanism available on this node".to_string())
    })?;

    normal_event(
        &ctx.recorder,
        node,
        events::REASON_NODE_REBOOT,
        "Remediation process: about to fence the unhealthy node by rebooting it",
    )
    .await;
    rebooter.reboot()?;

    // Do not re-enter the reboot step during the shutdown window
    Ok(Action::requeue(TIME_TO_ASSUME_REBOOT_HAS_STARTED))
}

/// Reboot-Completed: evict workloads per strategy, then mark success
async fn remove_node_resources(
    ctx: &ControllerState,
    request: &mut RemediationRequest,
    node: &Node,
    strategy: RemediationStrategy,
) -> Result<Action> {
    let node_name = node.name_any();
    match strategy {
        RemediationStrategy::ResourceDeletion => {
            resources::delete_node_resources(&ctx.client, &node_name).await?;
        }
        RemediationStrategy::OutOfServiceTaint => {
            if let Some(wait) = apply_out_of_service(ctx, request, node).await? {
                return Ok(wait);
            }
        }
        RemediationStrategy::Automatic => {
            return Err(Error::Unreconcilable(
                "automatic strategy was not resolved before resource removal".to_string(),
            ));
        }
    }

    normal_event(
        &ctx.recorder,
        node,
        events::REASON_DELETE_RESOURCES,
        "Remediation process: finished removing unhealthy node resources",
    )
    .await;

    request.set_phase(RemediationPhase::FencingCompleted);
    update_conditions(
        &mut request.status_mut().conditions,
        ProcessingChangeReason::FinishedSuccessfully,
    );
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Drive the out-of-service eviction. Returns a requeue action while the
/// cluster is still evicting, or `None` once the taint has been removed.
async fn apply_out_of_service(
    ctx: &ControllerState,
    request: &RemediationRequest,
    node: &Node,
) -> Result<Option<Action>> {
    add_out_of_service_taint(ctx, node).await?;

    if !resources::deletion_completed(&ctx.client, &node.name_any()).await? {
        return match out_of_service_wait(request.time_assumed_rebooted(), Utc::now()) {
            Some(poll) => Ok(Some(Action::requeue(poll))),
            None => Err(Error::RemediationError(
                "node resources were not removed before the out-of-service grace expired"
                    .to_string(),
            )),
        };
    }

    remove_out_of_service_taint(ctx, node).await?;
    Ok(None)
}

/// Fencing-Completed: once the request is being deleted, make the node
/// schedulable again and release the finalizer
async fn restore_node(
    ctx: &ControllerState,
    api: &Api<RemediationRequest>,
    request: &RemediationRequest,
    node: &Node,
) -> Result<Action> {
    if !finalizers::is_being_deleted(request) {
        return Ok(Action::await_change());
    }

    info!(node = %node.name_any(), "fencing completed, restoring node");

    if is_unschedulable(node) {
        let patch = json!({ "spec": { "unschedulable": false } });
        let nodes: Api<Node> = Api::all(ctx.client.clone());
        match nodes
            .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {}
            Err(err) if is_conflict(&err) => return Ok(Action::requeue(Duration::from_secs(1))),
            Err(err) => return Err(Error::KubeError(err)),
        }
        normal_event(
            &ctx.recorder,
            node,
            events::REASON_MARK_SCHEDULABLE,
            "Remediation process: healthy remediated node marked schedulable again",
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Wait until the node controller has dropped the unschedulable taint
    if taints::taint_exists(&node_taints(node), &taints::unschedulable_taint()) {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    remove_no_execute_taint(ctx, node).await?;

    if finalizers::has_finalizer(request) {
        finalizers::remove_finalizer(api, request).await?;
        normal_event(
            &ctx.recorder,
            request,
            events::REASON_REMOVE_FINALIZER,
            "Remediation process: finalizer removed from the request",
        )
        .await;
        normal_event(
            &ctx.recorder,
            request,
            events::REASON_REMEDIATION_FINISHED,
            "Remediation finished: node restored",
        )
        .await;
    }

    Ok(Action::await_change())
}

/// Marks the node unschedulable so a node that reboots into a healthy state
/// cannot pick up new workloads before its old ones are removed
async fn mark_unschedulable(
    ctx: &ControllerState,
    node: &Node,
    already_marked: bool,
) -> Result<Action> {
    if already_marked {
        debug!(node = %node.name_any(), "waiting for the unschedulable taint to appear");
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    info!(node = %node.name_any(), "marking node as unschedulable");
    let patch = json!({ "spec": { "unschedulable": true } });
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    match nodes
        .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(err) if is_conflict(&err) => return Ok(Action::requeue(Duration::from_secs(1))),
        Err(err) => return Err(Error::KubeError(err)),
    }
    normal_event(
        &ctx.recorder,
        node,
        events::REASON_MARK_UNSCHEDULABLE,
        "Remediation process: unhealthy node marked unschedulable",
    )
    .await;
    Ok(Action::requeue(Duration::from_secs(1)))
}

async fn add_no_execute_taint(ctx: &ControllerState, node: &Node) -> Result<()> {
    let current = node_taints(node);
    if taints::taint_exists(&current, &taints::remediation_taint()) {
        return Ok(());
    }

    let mut updated = current;
    updated.push(taints::remediation_taint());
    patch_node_taints(&ctx.client, &node.name_any(), updated).await?;

    info!(node = %node.name_any(), "NoExecute taint added");
    normal_event(
        &ctx.recorder,
        node,
        events::REASON_ADD_NO_EXECUTE,
        "Remediation process: NoExecute taint added to the unhealthy node",
    )
    .await;
    Ok(())
}

async fn remove_no_execute_taint(ctx: &ControllerState, node: &Node) -> Result<()> {
    let current = node_taints(node);
    let (remaining, deleted) = taints::delete_taint(&current, &taints::remediation_taint());
    if !deleted {
        return Ok(());
    }
    patch_node_taints(&ctx.client, &node.name_any(), remaining).await?;

    info!(node = %node.name_any(), "NoExecute taint removed");
    normal_event(
        &ctx.recorder,
        node,
        events::REASON_REMOVE_NO_EXECUTE,
        "Remediation process: NoExecute taint removed from the remediated node",
    )
    .await;
    Ok(())
}

async fn add_out_of_service_taint(ctx: &ControllerState, node: &Node) -> Result<()> {
    let current = node_taints(node);
    if taints::taint_exists(&current, &taints::out_of_service_taint()) {
        return Ok(());
    }

    let mut updated = current;
    updated.push(taints::out_of_service_taint());
    patch_node_taints(&ctx.client, &node.name_any(), updated).await?;

    info!(node = %node.name_any(), "out-of-service taint added");
    normal_event(
        &ctx.recorder,
        node,
        events::REASON_ADD_OUT_OF_SERVICE,
        "Remediation process: out-of-service taint added to the unhealthy node",
    )
    .await;
    Ok(())
}

async fn remove_out_of_service_taint(ctx: &ControllerState, node: &Node) -> Result<()> {
    let current = node_taints(node);
    let (remaining, deleted) = taints::delete_taint(&current, &taints::out_of_service_taint());
    if !deleted {
        return Ok(());
    }
    patch_node_taints(&ctx.client, &node.name_any(), remaining).await?;

    info!(node = %node.name_any(), "out-of-service taint removed");
    normal_event(
        &ctx.recorder,
        node,
        events::REASON_REMOVE_OUT_OF_SERVICE,
        "Remediation process: out-of-service taint removed",
    )
    .await;
    Ok(())
}

async fn patch_node_taints(
    client: &Client,
    node_name: &str,
    taints: Vec<k8s_openapi::api::core::v1::Taint>,
) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = json!({ "spec": { "taints": taints } });
    nodes
        .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// A node may only be fenced if the agent pod runs on it and the agent has
/// confirmed it can force a reboot
async fn is_node_reboot_capable(ctx: &ControllerState, node: &Node) -> bool {
    let pods: Api<Pod> = Api::all(ctx.client.clone());
    let selector = ListParams::default()
        .labels(taints::AGENT_POD_SELECTOR)
        .fields(&format!("spec.nodeName={}", node.name_any()));
    match pods.list(&selector).await {
        Ok(list) if !list.items.is_empty() => {}
        Ok(_) => {
            error!(node = %node.name_any(), "no fencing agent pod found on node, skipping remediation");
            return false;
        }
        Err(err) => {
            error!(node = %node.name_any(), %err, "failed to look up fencing agent pod");
            return false;
        }
    }

    let capable = node
        .annotations()
        .get(taints::REBOOT_CAPABLE_ANNOTATION)
        .map(String::as_str)
        == Some("true");
    if !capable {
        error!(
            node = %node.name_any(),
            "node's reboot-capable annotation is not 'true'; the node might not reboot and \
             removing its workloads would be unsafe"
        );
    }
    capable
}

/// Resolve the node targeted by a request. Machine-owned requests resolve
/// indirectly through the machine's `status.nodeRef`; everything else uses
/// the request name as the node name.
async fn get_node_for_request(client: &Client, request: &RemediationRequest) -> Result<Node> {
    if !is_owned_by_health_detector(request) {
        if let Some(owner) = request
            .owner_references()
            .iter()
            .find(|r| r.kind == "Machine")
        {
            let namespace = request.namespace().unwrap_or_else(|| "default".to_string());
            return get_node_from_machine(client, owner, &namespace).await;
        }
    }

    let nodes: Api<Node> = Api::all(client.clone());
    nodes.get(&request.name_any()).await.map_err(Error::KubeError)
}

async fn get_node_from_machine(
    client: &Client,
    owner: &OwnerReference,
    namespace: &str,
) -> Result<Node> {
    let (group, version) = owner
        .api_version
        .split_once('/')
        .unwrap_or(("", owner.api_version.as_str()));
    let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
    let machines: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &ApiResource::from_gvk(&gvk));

    let machine = machines.get(&owner.name).await.map_err(Error::KubeError)?;
    let node_name = machine.data["status"]["nodeRef"]["name"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            Error::RemediationError(format!("machine {} carries no nodeRef yet", owner.name))
        })?;

    let nodes: Api<Node> = Api::all(client.clone());
    nodes.get(&node_name).await.map_err(Error::KubeError)
}

async fn flush_status(
    api: &Api<RemediationRequest>,
    original: &RemediationRequest,
    updated: &RemediationRequest,
) -> Result<()> {
    if original.status == updated.status {
        return Ok(());
    }
    let patch = json!({ "status": updated.status });
    api.patch_status(
        &updated.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Exponential back-off per request: each consecutive failure of the same
/// request doubles its retry delay, independently of other requests
fn error_policy(
    request: Arc<RemediationRequest>,
    error: &Error,
    ctx: Arc<ControllerState>,
) -> Action {
    let (base, max) = if error.is_retriable() {
        (RETRIABLE_BACKOFF_BASE, RETRIABLE_BACKOFF_MAX)
    } else {
        (TERMINAL_BACKOFF_BASE, TERMINAL_BACKOFF_MAX)
    };
    let key = request.uid().unwrap_or_else(|| request.name_any());
    let delay = ctx.backoff.next_delay(&key, base, max);
    warn!(request = %request.name_any(), %error, ?delay, "reconciliation failed, backing off");
    Action::requeue(delay)
}

// --- pure decision helpers -------------------------------------------------

pub(crate) fn is_stopped_by_detector(request: &RemediationRequest) -> bool {
    request.metadata.deletion_timestamp.is_none()
        && request
            .annotations()
            .contains_key(taints::NHC_TIMED_OUT_ANNOTATION)
}

pub(crate) fn node_excluded(node: &Node) -> bool {
    node.labels()
        .get(taints::EXCLUDE_FROM_REMEDIATION_LABEL)
        .map(String::as_str)
        == Some("true")
}

pub fn is_owned_by_health_detector(request: &RemediationRequest) -> bool {
    request
        .owner_references()
        .iter()
        .any(|r| r.kind == "NodeHealthCheck")
}

/// Pick the effective strategy; `Automatic` is resolved against the live
/// cluster's capabilities at reconcile time
pub(crate) fn runtime_strategy(
    strategy: RemediationStrategy,
    out_of_service_taint_supported: bool,
) -> RemediationStrategy {
    match strategy {
        RemediationStrategy::Automatic if out_of_service_taint_supported => {
            RemediationStrategy::OutOfServiceTaint
        }
        RemediationStrategy::Automatic => RemediationStrategy::ResourceDeletion,
        other => other,
    }
}

/// Whether the assumed-reboot time has passed; when it has not, also how
/// long to wait before checking again
pub(crate) fn was_node_rebooted(
    time_assumed_rebooted: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (bool, Duration) {
    match time_assumed_rebooted {
        None => (false, Duration::from_secs(1)),
        Some(deadline) if deadline > now => {
            let left = (deadline - now).to_std().unwrap_or_default() + Duration::from_secs(1);
            (false, left)
        }
        Some(_) => (true, Duration::ZERO),
    }
}

/// True when system uptime is shorter than the request's age: the host came
/// back from a reboot after the request was created
pub(crate) fn already_rebooted(
    uptime: Duration,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let request_age = (now - created_at).to_std().unwrap_or_default();
    uptime < request_age
}

/// How long to keep polling the out-of-service eviction, if at all
pub(crate) fn out_of_service_wait(
    time_assumed_rebooted: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let base = time_assumed_rebooted?;
    let deadline = base + chrono::Duration::from_std(OUT_OF_SERVICE_GRACE).ok()?;
    if now < deadline {
        Some(OUT_OF_SERVICE_POLL)
    } else {
        None
    }
}

fn node_taints(node: &Node) -> Vec<k8s_openapi::api::core::v1::Taint> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false)
}

/// The `out-of-service` taint graduated with Kubernetes 1.26; older servers
/// fall back to resource deletion when the strategy is `Automatic`
pub async fn out_of_service_taint_supported(client: &Client) -> bool {
    match client.apiserver_version().await {
        Ok(version) => version_supports_out_of_service(&version.major, &version.minor),
        Err(err) => {
            warn!(%err, "failed to query apiserver version, assuming no out-of-service support");
            false
        }
    }
}

pub(crate) fn version_supports_out_of_service(major: &str, minor: &str) -> bool {
    let major: u32 = major.trim_end_matches('+').parse().unwrap_or(0);
    let minor: u32 = minor.trim_end_matches('+').parse().unwrap_or(0);
    major > 1 || (major == 1 && minor >= 26)
}
