//! Gate bypass lifecycle.
//!
//! A bypass request lets a workflow pass a failing quality gate under an
//! audit-logged, risk-assessed exception. Requests move through
//! `proposed -> approved|rejected`, an approved request becomes `active` the
//! first time a gate evaluation relies on it, and active requests end as
//! `expired` or `revoked`. Expiry is lazy: every coverage check and metrics
//! computation sweeps overdue requests first; there is no background timer.
//! Every transition lands in the bypass audit log.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::errors::{BypassError, BypassResult};
use crate::phase::Phase;
use crate::policy::PolicyLoader;

/// Risk grading used on bypass requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-dimension risk assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub technical: RiskLevel,
    pub business: RiskLevel,
    pub security: RiskLevel,
}

/// How long the bypass is meant to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassDuration {
    Temporary,
    Permanent,
}

/// Lifecycle state of a bypass request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassStatus {
    Proposed,
    Approved,
    Rejected,
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for BypassStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BypassStatus::Proposed => "proposed",
            BypassStatus::Approved => "approved",
            BypassStatus::Rejected => "rejected",
            BypassStatus::Active => "active",
            BypassStatus::Expired => "expired",
            BypassStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

impl BypassStatus {
    /// Whether the request was ever approved.
    fn counts_as_approved(&self) -> bool {
        matches!(
            self,
            BypassStatus::Approved | BypassStatus::Active | BypassStatus::Expired | BypassStatus::Revoked
        )
    }
}

/// Parameters for a new bypass request.
#[derive(Debug, Clone)]
pub struct BypassRequestSpec {
    pub workflow_id: String,
    pub phase: Phase,
    pub gate: String,
    pub current_value: f64,
    pub required_threshold: f64,
    pub justification: String,
    pub risks: RiskAssessment,
    pub duration: BypassDuration,
    pub expiration: Option<DateTime<Utc>>,
    pub remediation_plan: Option<String>,
    pub compensating_controls: Vec<String>,
    pub requested_by: String,
}

/// A bypass request and its full decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassRequest {
    pub id: Uuid,
    pub workflow_id: String,
    pub phase: Phase,
    pub gate: String,
    pub current_value: f64,
    pub required_threshold: f64,
    pub justification: String,
    pub risks: RiskAssessment,
    pub duration: BypassDuration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation_plan: Option<String>,
    #[serde(default)]
    pub compensating_controls: Vec<String>,
    pub requested_by: String,
    pub request_date: DateTime<Utc>,
    pub status: BypassStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adr_path: Option<PathBuf>,
    #[serde(default)]
    pub follow_up_tasks: Vec<String>,
}

/// Windowed bypass metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassMetrics {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub active: usize,
    pub expired: usize,
    /// Approved requests / total requests in the window.
    pub bypass_rate: f64,
    pub by_gate: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, usize>,
}

/// Owns bypass requests and enforces their state machine.
pub struct BypassManager {
    policy: Arc<PolicyLoader>,
    audit: Arc<AuditLog>,
    requests: RwLock<HashMap<Uuid, BypassRequest>>,
    alert_threshold: f64,
}

impl BypassManager {
    pub fn new(policy: Arc<PolicyLoader>, audit: Arc<AuditLog>) -> Self {
        let alert_threshold = policy.alert_threshold();
        Self {
            policy,
            audit,
            requests: RwLock::new(HashMap::new()),
            alert_threshold,
        }
    }

    /// Override the alert threshold (e.g. from `BYPASS_ALERT_THRESHOLD`).
    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    /// Propose a bypass. Rejected immediately when policy forbids bypassing
    /// this gate; nothing is recorded in that case.
    pub fn create_request(&self, spec: BypassRequestSpec) -> BypassResult<BypassRequest> {
        if !self.policy.can_bypass(&spec.gate, spec.phase) {
            return Err(BypassError::NotBypassable {
                gate: spec.gate,
                phase: spec.phase.to_string(),
            });
        }

        let request = BypassRequest {
            id: Uuid::new_v4(),
            workflow_id: spec.workflow_id,
            phase: spec.phase,
            gate: spec.gate,
            current_value: spec.current_value,
            required_threshold: spec.required_threshold,
            justification: spec.justification,
            risks: spec.risks,
            duration: spec.duration,
            expiration: spec.expiration,
            remediation_plan: spec.remediation_plan,
            compensating_controls: spec.compensating_controls,
            requested_by: spec.requested_by,
            request_date: Utc::now(),
            status: BypassStatus::Proposed,
            approver: None,
            approval_date: None,
            adr_path: None,
            follow_up_tasks: Vec::new(),
        };

        self.log_transition(&request, "bypass_requested", &request.requested_by.clone(), None)?;
        self.requests.write().insert(request.id, request.clone());
        info!(gate = %request.gate, phase = %request.phase, id = %request.id, "bypass requested");
        Ok(request)
    }

    /// Approve a proposed request.
    ///
    /// When policy demands an ADR for this gate, approval without one is
    /// rejected (and audited) while the request stays `proposed`.
    pub fn approve(
        &self,
        id: Uuid,
        approver: &str,
        adr_path: Option<&Path>,
        expiration: Option<DateTime<Utc>>,
        compensating_controls: Option<Vec<String>>,
    ) -> BypassResult<BypassRequest> {
        let mut requests = self.requests.write();
        let request = requests.get_mut(&id).ok_or(BypassError::NotFound(id))?;
        if request.status != BypassStatus::Proposed {
            return Err(BypassError::InvalidTransition {
                from: request.status.to_string(),
                to: BypassStatus::Approved.to_string(),
            });
        }

        let requirements = self.policy.bypass_requirements(&request.gate, request.phase);
        if requirements.requires_adr && adr_path.is_none() {
            let snapshot = request.clone();
            drop(requests);
            self.log_transition(
                &snapshot,
                "bypass_rejected",
                approver,
                Some(json!({ "reason": "approval requires an ADR" })),
            )?;
            warn!(gate = %snapshot.gate, id = %id, "approval rejected: ADR required");
            return Err(BypassError::AdrRequired {
                gate: snapshot.gate,
            });
        }

        request.status = BypassStatus::Approved;
        request.approver = Some(approver.to_string());
        request.approval_date = Some(Utc::now());
        request.adr_path = adr_path.map(|p| p.to_path_buf());
        if expiration.is_some() {
            request.expiration = expiration;
        }
        if let Some(controls) = compensating_controls {
            request.compensating_controls.extend(controls);
        }
        let snapshot = request.clone();
        drop(requests);

        self.log_transition(
            &snapshot,
            "bypass_approved",
            approver,
            Some(json!({ "adr_path": snapshot.adr_path })),
        )?;
        info!(gate = %snapshot.gate, id = %id, approver, "bypass approved");
        Ok(snapshot)
    }

    /// Reject a proposed request.
    pub fn reject(&self, id: Uuid, rejector: &str, reason: &str) -> BypassResult<BypassRequest> {
        let mut requests = self.requests.write();
        let request = requests.get_mut(&id).ok_or(BypassError::NotFound(id))?;
        if request.status != BypassStatus::Proposed {
            return Err(BypassError::InvalidTransition {
                from: request.status.to_string(),
                to: BypassStatus::Rejected.to_string(),
            });
        }
        request.status = BypassStatus::Rejected;
        let snapshot = request.clone();
        drop(requests);

        self.log_transition(
            &snapshot,
            "bypass_rejected",
            rejector,
            Some(json!({ "reason": reason })),
        )?;
        info!(gate = %snapshot.gate, id = %id, "bypass rejected");
        Ok(snapshot)
    }

    /// Revoke an active bypass.
    pub fn revoke(&self, id: Uuid, revoker: &str, reason: &str) -> BypassResult<BypassRequest> {
        let mut requests = self.requests.write();
        let request = requests.get_mut(&id).ok_or(BypassError::NotFound(id))?;
        if request.status != BypassStatus::Active {
            return Err(BypassError::InvalidTransition {
                from: request.status.to_string(),
                to: BypassStatus::Revoked.to_string(),
            });
        }
        request.status = BypassStatus::Revoked;
        let snapshot = request.clone();
        drop(requests);

        self.log_transition(
            &snapshot,
            "bypass_revoked",
            revoker,
            Some(json!({ "reason": reason })),
        )?;
        Ok(snapshot)
    }

    /// Whether an approved or active bypass covers `gate` in `phase` for
    /// this workflow. Applying an approved request transitions it to
    /// `active`.
    pub fn covers(&self, workflow_id: &str, phase: Phase, gate: &str) -> BypassResult<bool> {
        self.expire_overdue()?;

        let mut requests = self.requests.write();
        let candidate = requests.values_mut().find(|r| {
            r.workflow_id == workflow_id
                && r.phase == phase
                && r.gate == gate
                && matches!(r.status, BypassStatus::Approved | BypassStatus::Active)
        });
        let Some(request) = candidate else {
            return Ok(false);
        };

        if request.status == BypassStatus::Approved {
            request.status = BypassStatus::Active;
            let snapshot = request.clone();
            drop(requests);
            self.log_transition(&snapshot, "bypass_activated", "gate_validator", None)?;
            info!(gate, %workflow_id, "bypass applied");
        }
        Ok(true)
    }

    /// Seed requests restored from persistence.
    ///
    /// Ids already known to this manager are left untouched. No audit
    /// events are emitted; the transitions were logged when they happened.
    pub fn import(&self, requests: Vec<BypassRequest>) {
        let mut map = self.requests.write();
        for request in requests {
            map.entry(request.id).or_insert(request);
        }
    }

    /// Transition overdue requests to `expired`.
    ///
    /// Sweeps `active` requests, and also `approved` requests that passed
    /// their expiration before ever being applied; an expired approval must
    /// never activate.
    pub fn expire_overdue(&self) -> BypassResult<usize> {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let mut requests = self.requests.write();
            for request in requests.values_mut() {
                if matches!(request.status, BypassStatus::Active | BypassStatus::Approved) {
                    if let Some(expiration) = request.expiration {
                        if expiration < now {
                            request.status = BypassStatus::Expired;
                            expired.push(request.clone());
                        }
                    }
                }
            }
        }
        for request in &expired {
            warn!(gate = %request.gate, id = %request.id, "bypass expired");
            self.log_transition(request, "bypass_expired", "bypass_manager", None)?;
        }
        Ok(expired.len())
    }

    pub fn get(&self, id: Uuid) -> Option<BypassRequest> {
        self.requests.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<BypassRequest> {
        let mut all: Vec<BypassRequest> = self.requests.read().values().cloned().collect();
        all.sort_by_key(|r| r.request_date);
        all
    }

    /// Metrics over requests created in the last `window_days`.
    ///
    /// The rate counts only approved bypasses in the numerator; requests
    /// created in the window form the denominator. Crossing the alert
    /// threshold logs a warning, crossing twice the threshold a critical
    /// alert.
    pub fn metrics(&self, window_days: i64) -> BypassResult<BypassMetrics> {
        self.expire_overdue()?;
        let cutoff = Utc::now() - Duration::days(window_days);
        let requests = self.requests.read();
        let window: Vec<&BypassRequest> = requests
            .values()
            .filter(|r| r.request_date >= cutoff)
            .collect();

        let total = window.len();
        let approved = window.iter().filter(|r| r.status.counts_as_approved()).count();
        let rejected = window
            .iter()
            .filter(|r| r.status == BypassStatus::Rejected)
            .count();
        let active = window
            .iter()
            .filter(|r| r.status == BypassStatus::Active)
            .count();
        let expired = window
            .iter()
            .filter(|r| r.status == BypassStatus::Expired)
            .count();

        let mut by_gate: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_phase: BTreeMap<String, usize> = BTreeMap::new();
        for request in &window {
            *by_gate.entry(request.gate.clone()).or_default() += 1;
            *by_phase.entry(request.phase.to_string()).or_default() += 1;
        }

        let bypass_rate = if total == 0 {
            0.0
        } else {
            approved as f64 / total as f64
        };
        drop(requests);

        if total > 0 && bypass_rate >= self.alert_threshold * 2.0 {
            error!(bypass_rate, threshold = self.alert_threshold, "critical bypass rate");
            self.append_audit(
                AuditEvent::new("bypass_rate_alert", "bypass_manager").with_payload(json!({
                    "bypass_rate": bypass_rate,
                    "level": "critical",
                })),
            )?;
        } else if total > 0 && bypass_rate >= self.alert_threshold {
            warn!(bypass_rate, threshold = self.alert_threshold, "elevated bypass rate");
            self.append_audit(
                AuditEvent::new("bypass_rate_alert", "bypass_manager").with_payload(json!({
                    "bypass_rate": bypass_rate,
                    "level": "warning",
                })),
            )?;
        }

        Ok(BypassMetrics {
            total,
            approved,
            rejected,
            active,
            expired,
            bypass_rate,
            by_gate,
            by_phase,
        })
    }

    fn log_transition(
        &self,
        request: &BypassRequest,
        event_type: &str,
        actor: &str,
        payload: Option<serde_json::Value>,
    ) -> BypassResult<()> {
        let mut event = AuditEvent::new(event_type, actor)
            .with_workflow(&request.workflow_id)
            .with_phase(request.phase)
            .with_bypass(request.id)
            .with_payload(payload.unwrap_or_else(|| {
                json!({
                    "gate": request.gate,
                    "current_value": request.current_value,
                    "required_threshold": request.required_threshold,
                })
            }));
        if event.payload.get("gate").is_none() {
            if let Some(map) = event.payload.as_object_mut() {
                map.insert("gate".to_string(), json!(request.gate));
            }
        }
        self.append_audit(event)
    }

    fn append_audit(&self, event: AuditEvent) -> BypassResult<()> {
        self.audit
            .append(&event)
            .map_err(|e| BypassError::Audit(e.to_string()))
    }
}
