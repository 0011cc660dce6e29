//! Pure status transforms applied before writing edge reports to the store.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, NodeStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{DateTime, SubsecRound, Utc};
use kedge_core::constants::{GPU_RESOURCE_NAME, GPU_STATUS_ANNOTATION};
use kedge_core::payload::ExtendResource;
use serde::Serialize;

const PHASE_SUCCEEDED: &str = "Succeeded";
const PHASE_FAILED: &str = "Failed";

/// Drop sub-second precision; the store only keeps RFC3339 seconds.
pub fn rfc3339(t: &mut Time) {
    t.0 = t.0.trunc_subsecs(0);
}

fn rfc3339_opt(t: &mut Option<Time>) {
    if let Some(t) = t.as_mut() {
        rfc3339(t);
    }
}

fn is_zero(t: &Time) -> bool {
    t.0.timestamp() <= 0
}

fn normalize_state(state: &mut Option<ContainerState>) {
    let Some(state) = state.as_mut() else { return };
    if let Some(running) = state.running.as_mut() {
        rfc3339_opt(&mut running.started_at);
    }
    if let Some(terminated) = state.terminated.as_mut() {
        rfc3339_opt(&mut terminated.started_at);
        rfc3339_opt(&mut terminated.finished_at);
    }
}

fn normalize_containers(statuses: &mut [ContainerStatus]) {
    for cs in statuses.iter_mut() {
        normalize_state(&mut cs.state);
        normalize_state(&mut cs.last_state);
    }
}

/// Carry over what the store already knows and normalize the rest.
///
/// A condition whose status did not change keeps its stored transition time;
/// any other condition transitions `now`. A non-zero stored start time wins,
/// otherwise the reported one is used, otherwise `now`.
pub fn merge_pod_status(stored: &Pod, mut status: PodStatus, now: DateTime<Utc>) -> PodStatus {
    let old = stored.status.as_ref();

    for cond in status.conditions.iter_mut().flatten() {
        let prev = old
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == cond.type_));
        cond.last_transition_time = match prev {
            Some(p) if p.status == cond.status => p.last_transition_time.clone().or_else(|| Some(Time(now))),
            _ => Some(Time(now)),
        };
    }

    let stored_start = old.and_then(|s| s.start_time.clone()).filter(|t| !is_zero(t));
    status.start_time = match stored_start {
        Some(t) => Some(t),
        None => status.start_time.filter(|t| !is_zero(t)).or(Some(Time(now))),
    };

    normalize_pod_status(stored, &mut status);
    status
}

/// Second-precision timestamps, container statuses sorted by name, init
/// container statuses in spec order.
pub fn normalize_pod_status(pod: &Pod, status: &mut PodStatus) {
    rfc3339_opt(&mut status.start_time);
    for cond in status.conditions.iter_mut().flatten() {
        rfc3339_opt(&mut cond.last_probe_time);
        rfc3339_opt(&mut cond.last_transition_time);
    }

    if let Some(statuses) = status.container_statuses.as_mut() {
        normalize_containers(statuses);
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
    }

    if let Some(statuses) = status.init_container_statuses.as_mut() {
        normalize_containers(statuses);
        let order: Vec<&str> = pod
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .map(|cs| cs.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default();
        statuses.sort_by_key(|s| order.iter().position(|n| *n == s.name).unwrap_or(usize::MAX));
    }
}

/// No container is running: every status is terminated or waiting.
pub fn no_container_running(status: &PodStatus) -> bool {
    status.container_statuses.iter().flatten().all(|cs| {
        cs.state.as_ref().is_some_and(|s| s.terminated.is_some() || s.waiting.is_some())
    })
}

/// A pod being deleted that finished and has nothing left running can be removed immediately.
pub fn should_purge(updated: &Pod, status: &PodStatus) -> bool {
    let terminal = matches!(status.phase.as_deref(), Some(PHASE_SUCCEEDED) | Some(PHASE_FAILED));
    updated.metadata.deletion_timestamp.is_some() && terminal && no_container_running(status)
}

/// Rewrite heartbeat and transition times older than `frequency` to `now`.
pub fn refresh_stale_heartbeats(status: &mut NodeStatus, frequency: Duration, now: DateTime<Utc>) {
    let stale = |t: &Option<Time>| match t {
        Some(t) => (now - t.0).to_std().map(|age| age > frequency).unwrap_or(false),
        None => true,
    };
    for cond in status.conditions.iter_mut().flatten() {
        if stale(&cond.last_heartbeat_time) {
            cond.last_heartbeat_time = Some(Time(now));
        }
        if stale(&cond.last_transition_time) {
            cond.last_transition_time = Some(Time(now));
        }
    }
}

#[derive(Serialize)]
struct GpuStatus<'a> {
    id: &'a str,
    healthy: bool,
}

/// One JSON annotation per extended resource, plus the GPU health list.
pub fn extended_resource_annotations(
    resources: &BTreeMap<String, Vec<ExtendResource>>,
) -> Result<BTreeMap<String, String>, serde_json::Error> {
    let mut out = BTreeMap::new();
    for (name, list) in resources {
        if name == GPU_RESOURCE_NAME && !list.is_empty() {
            let gpus: Vec<GpuStatus<'_>> = list.iter().map(|r| GpuStatus { id: &r.name, healthy: true }).collect();
            out.insert(GPU_STATUS_ANNOTATION.to_string(), serde_json::to_string(&gpus)?);
        }
        out.insert(name.clone(), serde_json::to_string(list)?);
    }
    Ok(out)
}
