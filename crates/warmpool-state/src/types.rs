//! Persisted entities: instances, stage owners, capacity reservations,
//! outbox jobs, and utilization history.
//!
//! All types serialize to JSON, which is how the redb backend stores them
//! and how the PostgreSQL backend stores labels and job params.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use warmpool_core::{DEFAULT_VARIANT_ID, MachineConfig, Platform, RETAIN_LABEL, TTL_LABEL};

use crate::error::{StateError, StateResult};

/// Unique identifier assigned by the driver on create.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Created,
    InUse,
    Hibernating,
    Terminating,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Created => "created",
            InstanceState::InUse => "inuse",
            InstanceState::Hibernating => "hibernating",
            InstanceState::Terminating => "terminating",
            InstanceState::Stopped => "stopped",
        }
    }

    /// States counted as warm inventory.
    pub const FREE: [InstanceState; 2] = [InstanceState::Created, InstanceState::Hibernating];
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(InstanceState::Created),
            "inuse" => Ok(InstanceState::InUse),
            "hibernating" => Ok(InstanceState::Hibernating),
            "terminating" => Ok(InstanceState::Terminating),
            "stopped" => Ok(InstanceState::Stopped),
            other => Err(StateError::Deserialize(format!(
                "unknown instance state: {other}"
            ))),
        }
    }
}

/// A VM tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// `{runner}-{pool}-{rand8}`.
    pub name: String,
    #[serde(default)]
    pub node_id: Option<String>,

    pub pool: String,
    /// Driver tag that created the VM.
    pub provider: String,
    pub zone: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub platform: Platform,
    pub variant_id: String,

    pub address: String,
    /// Guest agent port.
    pub port: u16,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub ca_key: String,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,

    pub state: InstanceState,
    pub is_hibernated: bool,
    /// Unix seconds; reset when a hibernated instance is claimed.
    pub started: i64,
    pub updated: i64,
    #[serde(default)]
    pub owner_id: String,
    /// Stage-runtime ID bound while `inuse`.
    #[serde(default)]
    pub stage: String,
    /// Replica that created the instance.
    pub runner_name: String,

    /// Comma-separated external disk IDs.
    #[serde(default)]
    pub storage_identifier: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Instance {
    /// Whether the `retain` label pins this instance against age-based purging.
    pub fn is_retained(&self) -> bool {
        self.labels.get(RETAIN_LABEL).map(String::as_str) == Some("true")
    }

    /// Purge eligibility: only instances explicitly labelled `retain=false`.
    pub fn is_purgeable(&self) -> bool {
        self.labels.get(RETAIN_LABEL).map(String::as_str) == Some("false")
    }

    pub fn has_ttl(&self) -> bool {
        self.labels.contains_key(TTL_LABEL)
    }

    pub fn set_retain(&mut self, retain: bool) {
        self.labels
            .insert(RETAIN_LABEL.to_string(), retain.to_string());
    }

    /// Warm and claimable (possibly after resuming).
    pub fn is_free(&self) -> bool {
        InstanceState::FREE.contains(&self.state)
    }

    /// External disk IDs attached to the instance.
    pub fn storage_ids(&self) -> Vec<&str> {
        self.storage_identifier
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Sort key used for claiming: oldest `started` first, then lowest ID.
    pub fn claim_order(&self) -> (i64, &str) {
        (self.started, self.id.as_str())
    }

    pub fn labels_json(&self) -> String {
        serde_json::to_string(&self.labels).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Filter over instances. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceQuery {
    pub pool: Option<String>,
    pub instance_id: Option<String>,
    pub state: Option<InstanceState>,
    pub variant_id: Option<String>,
    pub owner_id: Option<String>,
    pub stage: Option<String>,
    pub image: Option<String>,
    pub size: Option<String>,
    pub zone: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    /// Match on the `retain` label value.
    pub retain: Option<bool>,
}

impl InstanceQuery {
    pub fn pool(name: &str) -> Self {
        Self {
            pool: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_variant(mut self, variant_id: &str) -> Self {
        self.variant_id = Some(variant_id.to_string());
        self
    }

    pub fn with_instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().is_none_or(|f| f == value)
        }

        eq(&self.pool, &instance.pool)
            && eq(&self.instance_id, &instance.id)
            && self.state.is_none_or(|s| s == instance.state)
            && eq(&self.variant_id, &instance.variant_id)
            && eq(&self.owner_id, &instance.owner_id)
            && eq(&self.stage, &instance.stage)
            && eq(&self.image, &instance.image)
            && eq(&self.size, &instance.size)
            && eq(&self.zone, &instance.zone)
            && eq(&self.os, &instance.platform.os)
            && eq(&self.arch, &instance.platform.arch)
            && self.retain.is_none_or(|r| {
                if r {
                    instance.is_retained()
                } else {
                    instance.is_purgeable()
                }
            })
    }
}

/// Field-level change to one instance row. Unset fields are left as stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstancePatch {
    pub state: Option<InstanceState>,
    pub is_hibernated: Option<bool>,
    pub address: Option<String>,
    pub owner_id: Option<String>,
    pub stage: Option<String>,
    pub started: Option<i64>,
    /// Merged into the stored labels.
    pub labels: BTreeMap<String, String>,
    pub updated: i64,
}

impl InstancePatch {
    pub fn at(now: i64) -> Self {
        Self {
            updated: now,
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_hibernated(mut self, hibernated: bool) -> Self {
        self.is_hibernated = Some(hibernated);
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn apply(&self, instance: &mut Instance) {
        if let Some(state) = self.state {
            instance.state = state;
        }
        if let Some(hibernated) = self.is_hibernated {
            instance.is_hibernated = hibernated;
        }
        if let Some(address) = &self.address {
            instance.address = address.clone();
        }
        if let Some(owner_id) = &self.owner_id {
            instance.owner_id = owner_id.clone();
        }
        if let Some(stage) = &self.stage {
            instance.stage = stage.clone();
        }
        if let Some(started) = self.started {
            instance.started = started;
        }
        instance
            .labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        instance.updated = self.updated;
    }
}

/// Age cut-offs for one purger sweep (all unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeCriteria {
    /// `inuse` without a `ttl` label and started before this.
    pub busy_before: i64,
    /// `inuse` with a `ttl` label and started before this.
    pub ttl_busy_before: i64,
    /// `created`/`hibernating` started before this.
    pub free_before: i64,
    /// `terminating` rows not touched since this (a previous destroy failed).
    pub terminating_before: i64,
}

impl PurgeCriteria {
    pub fn selects(&self, instance: &Instance) -> bool {
        if !instance.is_purgeable() {
            return false;
        }
        match instance.state {
            InstanceState::InUse if instance.has_ttl() => instance.started < self.ttl_busy_before,
            InstanceState::InUse => instance.started < self.busy_before,
            InstanceState::Created | InstanceState::Hibernating => {
                instance.started < self.free_before
            }
            InstanceState::Terminating => instance.updated < self.terminating_before,
            InstanceState::Stopped => false,
        }
    }
}

/// In-use count for one (pool, variant) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolVariantCount {
    pub pool: String,
    pub variant_id: String,
    pub count: u32,
}

// ── Stage owner ───────────────────────────────────────────────────

/// Maps a stage-runtime ID to the pool owning its VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOwner {
    pub stage_id: String,
    pub pool_name: String,
}

// ── Capacity reservation ──────────────────────────────────────────

/// Cloud capacity reserved for a stage ahead of provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReservation {
    pub stage_id: String,
    pub pool_name: String,
    /// Empty until a `Create` consumes the reservation.
    #[serde(default)]
    pub instance_id: String,
    pub reservation_id: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub machine_ip: String,
    pub created_at: i64,
}

impl CapacityReservation {
    pub fn is_consumed(&self) -> bool {
        !self.instance_id.is_empty()
    }
}

// ── Outbox ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxJobType {
    SetupInstance,
    Scale,
}

impl OutboxJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxJobType::SetupInstance => "setup_instance",
            OutboxJobType::Scale => "scale",
        }
    }
}

impl fmt::Display for OutboxJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxJobType {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup_instance" => Ok(OutboxJobType::SetupInstance),
            "scale" => Ok(OutboxJobType::Scale),
            other => Err(StateError::Deserialize(format!("unknown job type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxJobStatus {
    Pending,
    Running,
}

impl OutboxJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxJobStatus::Pending => "pending",
            OutboxJobStatus::Running => "running",
        }
    }
}

impl FromStr for OutboxJobStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxJobStatus::Pending),
            "running" => Ok(OutboxJobStatus::Running),
            other => Err(StateError::Deserialize(format!("unknown job status: {other}"))),
        }
    }
}

/// A durable unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxJob {
    /// Assigned by the store on create.
    pub id: i64,
    pub pool_name: String,
    /// Empty means any replica may claim it.
    pub runner_name: String,
    pub job_type: OutboxJobType,
    pub job_params: serde_json::Value,
    pub status: OutboxJobStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

impl OutboxJob {
    /// A new pending job; the store assigns the ID.
    pub fn new(
        pool_name: &str,
        runner_name: &str,
        job_type: OutboxJobType,
        job_params: serde_json::Value,
        now: i64,
    ) -> Self {
        Self {
            id: 0,
            pool_name: pool_name.to_string(),
            runner_name: runner_name.to_string(),
            job_type,
            job_params,
            status: OutboxJobStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: now,
            processed_at: None,
        }
    }

    /// `window_start` carried by scale jobs.
    pub fn window_start(&self) -> Option<i64> {
        self.job_params.get("window_start").and_then(|v| v.as_i64())
    }
}

/// Params of a `setup_instance` job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SetupInstanceParams {
    pub pool_name: String,
    #[serde(default)]
    pub machine: MachineConfig,
}

/// Params of a `scale` job: the window it prepares for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleParams {
    pub window_start: i64,
    pub window_end: i64,
}

impl OutboxJob {
    /// A `setup_instance` job any replica may claim.
    pub fn setup_instance(params: &SetupInstanceParams, now: i64) -> StateResult<Self> {
        let value =
            serde_json::to_value(params).map_err(|e| StateError::Serialize(e.to_string()))?;
        Ok(Self::new(
            &params.pool_name,
            "",
            OutboxJobType::SetupInstance,
            value,
            now,
        ))
    }

    /// A `scale` job for one pool and window.
    pub fn scale(pool_name: &str, params: ScaleParams, now: i64) -> StateResult<Self> {
        let value =
            serde_json::to_value(params).map_err(|e| StateError::Serialize(e.to_string()))?;
        Ok(Self::new(pool_name, "", OutboxJobType::Scale, value, now))
    }

    /// Decode `job_params` into a typed payload.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> StateResult<T> {
        serde_json::from_value(self.job_params.clone())
            .map_err(|e| StateError::Deserialize(format!("job {} params: {e}", self.id)))
    }
}

// ── Utilization history ──────────────────────────────────────────

/// One in-use sample for a (pool, variant) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationRecord {
    pub pool_name: String,
    pub variant_id: String,
    pub in_use_instances: u32,
    pub recorded_at: i64,
}

impl UtilizationRecord {
    pub fn new(pool_name: &str, variant_id: &str, in_use_instances: u32, recorded_at: i64) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            variant_id: if variant_id.is_empty() {
                DEFAULT_VARIANT_ID.to_string()
            } else {
                variant_id.to_string()
            },
            in_use_instances,
            recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn instance(id: &str, state: InstanceState, started: i64) -> Instance {
        Instance {
            id: id.to_string(),
            name: format!("runner-pool-{id}"),
            node_id: None,
            pool: "linux-amd64".to_string(),
            provider: "fake".to_string(),
            zone: "zone-a".to_string(),
            region: "region".to_string(),
            size: "small".to_string(),
            image: "ubuntu".to_string(),
            platform: Platform {
                os: "linux".to_string(),
                arch: "amd64".to_string(),
                ..Platform::default()
            },
            variant_id: DEFAULT_VARIANT_ID.to_string(),
            address: "10.0.0.1".to_string(),
            port: 9079,
            ca_cert: String::new(),
            ca_key: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            state,
            is_hibernated: false,
            started,
            updated: started,
            owner_id: String::new(),
            stage: String::new(),
            runner_name: "runner".to_string(),
            storage_identifier: String::new(),
            labels: BTreeMap::from([(RETAIN_LABEL.to_string(), "false".to_string())]),
        }
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            InstanceState::Created,
            InstanceState::InUse,
            InstanceState::Hibernating,
            InstanceState::Terminating,
            InstanceState::Stopped,
        ] {
            assert_eq!(state.as_str().parse::<InstanceState>().unwrap(), state);
        }
        assert_eq!(
            serde_json::to_string(&InstanceState::InUse).unwrap(),
            "\"inuse\""
        );
        assert!("busy".parse::<InstanceState>().is_err());
    }

    #[test]
    fn retain_labels() {
        let mut inst = instance("i-1", InstanceState::Created, 100);
        assert!(inst.is_purgeable());
        assert!(!inst.is_retained());

        inst.set_retain(true);
        assert!(inst.is_retained());
        assert!(!inst.is_purgeable());

        inst.labels.clear();
        assert!(!inst.is_retained());
        assert!(!inst.is_purgeable());
    }

    #[test]
    fn storage_ids_split_and_trim() {
        let mut inst = instance("i-1", InstanceState::Created, 100);
        inst.storage_identifier = "disk-a, disk-b,,".to_string();
        assert_eq!(inst.storage_ids(), vec!["disk-a", "disk-b"]);
    }

    #[test]
    fn query_matches_fields() {
        let inst = instance("i-1", InstanceState::Created, 100);
        assert!(InstanceQuery::default().matches(&inst));
        assert!(InstanceQuery::pool("linux-amd64").matches(&inst));
        assert!(!InstanceQuery::pool("windows").matches(&inst));
        assert!(
            InstanceQuery::pool("linux-amd64")
                .with_state(InstanceState::Created)
                .with_retain(false)
                .matches(&inst)
        );
        assert!(
            !InstanceQuery::default()
                .with_state(InstanceState::InUse)
                .matches(&inst)
        );
        assert!(!InstanceQuery::default().with_retain(true).matches(&inst));
    }

    #[test]
    fn patch_touches_only_set_fields() {
        let mut inst = instance("i-1", InstanceState::InUse, 100);
        inst.owner_id = "build-1".to_string();
        inst.stage = "stage-1".to_string();

        let mut patch = InstancePatch::at(300).with_hibernated(true);
        patch.labels.insert("team".to_string(), "ci".to_string());
        patch.apply(&mut inst);

        assert!(inst.is_hibernated);
        assert_eq!(inst.state, InstanceState::InUse);
        assert_eq!(inst.owner_id, "build-1");
        assert_eq!(inst.stage, "stage-1");
        assert_eq!(inst.address, "10.0.0.1");
        assert_eq!(inst.updated, 300);
        assert_eq!(inst.labels.get("team").map(String::as_str), Some("ci"));
        assert!(inst.is_purgeable());
    }

    #[test]
    fn purge_criteria_selection() {
        let criteria = PurgeCriteria {
            busy_before: 1000,
            ttl_busy_before: 500,
            free_before: 800,
            terminating_before: 900,
        };

        let old_busy = instance("a", InstanceState::InUse, 999);
        assert!(criteria.selects(&old_busy));

        let mut ttl_busy = instance("b", InstanceState::InUse, 999);
        ttl_busy.labels.insert(TTL_LABEL.to_string(), "7d".to_string());
        assert!(!criteria.selects(&ttl_busy));
        ttl_busy.started = 499;
        assert!(criteria.selects(&ttl_busy));

        let fresh_free = instance("c", InstanceState::Hibernating, 800);
        assert!(!criteria.selects(&fresh_free));

        let mut retained = instance("d", InstanceState::InUse, 1);
        retained.set_retain(true);
        assert!(!criteria.selects(&retained));

        let mut stuck = instance("e", InstanceState::Terminating, 1);
        stuck.updated = 899;
        assert!(criteria.selects(&stuck));
    }

    #[test]
    fn scale_job_window_start() {
        let job = OutboxJob::new(
            "pool",
            "",
            OutboxJobType::Scale,
            serde_json::json!({"pool_name": "pool", "window_start": 1800, "window_end": 3600}),
            10,
        );
        assert_eq!(job.window_start(), Some(1800));
        assert_eq!(job.status, OutboxJobStatus::Pending);
    }

    #[test]
    fn typed_job_params() {
        let params = SetupInstanceParams {
            pool_name: "pool".to_string(),
            machine: MachineConfig {
                variant_id: Some("large".to_string()),
                ..MachineConfig::default()
            },
        };
        let job = OutboxJob::setup_instance(&params, 5).unwrap();
        assert_eq!(job.runner_name, "");
        assert_eq!(job.job_type, OutboxJobType::SetupInstance);
        assert_eq!(job.params::<SetupInstanceParams>().unwrap(), params);

        let scale = OutboxJob::scale(
            "pool",
            ScaleParams {
                window_start: 1800,
                window_end: 3600,
            },
            5,
        )
        .unwrap();
        assert_eq!(scale.window_start(), Some(1800));
        assert!(scale.params::<SetupInstanceParams>().is_err());
    }
}
