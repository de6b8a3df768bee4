use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud-reported instance lifecycle state (EC2's `instance-state-name`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "instance_state", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }
}

/// Cloud-reported spot-request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "spot_request_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
}

/// Free-form status code the cloud attaches to an open spot request
/// (`pending-evaluation`, `pending-fulfillment`, `price-too-low`, ...).
///
/// Kept as a validated newtype rather than an exhaustive enum: spec.md
/// treats "any other status" as a catch-all branch, and the cloud adds new
/// status codes over time without our schema needing to track every one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct SpotRequestStatus(pub String);

impl SpotRequestStatus {
    pub const PENDING_EVALUATION: &'static str = "pending-evaluation";
    pub const PENDING_FULFILLMENT: &'static str = "pending-fulfillment";

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_pending(&self) -> bool {
        self.0 == Self::PENDING_EVALUATION || self.0 == Self::PENDING_FULFILLMENT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Termination classification derived from a fixed allowlist of "expected"
/// shutdown reason codes (spec.md §4.6 point 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationClass {
    Clean,
    Exceptional,
}

const CLEAN_TERMINATION_CODES: &[&str] = &[
    "Client.InstanceInitiatedShutdown",
    "Client.UserInitiatedShutdown",
    "Client.VolumeLimitExceeded",
    "Server.SpotInstanceTermination",
];

pub fn classify_termination(code: &str) -> TerminationClass {
    if CLEAN_TERMINATION_CODES.contains(&code) {
        TerminationClass::Clean
    } else {
        TerminationClass::Exceptional
    }
}

/// `(region, id)` row recorded by event ingest, housekeeper, or `runInstance`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub region: String,
    pub id: String,
    pub worker_type: String,
    pub availability_zone: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub image_id: String,
    pub launched: DateTime<Utc>,
    pub last_event: DateTime<Utc>,
    pub source_request_id: Option<String>,
}

/// `(region, id)` row tracking an outstanding spot request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpotRequest {
    pub region: String,
    pub id: String,
    pub worker_type: String,
    pub availability_zone: String,
    pub instance_type: String,
    pub state: SpotRequestState,
    pub status: SpotRequestStatus,
    pub image_id: String,
    pub created: DateTime<Utc>,
}

/// A Termination row exists only for instances already departed the
/// `instances` table (spec.md §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Termination {
    pub region: String,
    pub id: String,
    pub worker_type: String,
    pub availability_zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub launched: DateTime<Utc>,
    pub terminated: DateTime<Utc>,
    pub code: Option<String>,
    pub reason: Option<String>,
    pub last_event: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AmiUsage {
    pub region: String,
    pub id: String,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EbsUsage {
    pub region: String,
    pub volume_type: String,
    pub state: String,
    pub total_count: i64,
    pub total_gb: i64,
    pub touched: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AwsRequestLog {
    pub id: uuid::Uuid,
    pub region: String,
    pub service: String,
    pub method: String,
    pub called: DateTime<Utc>,
    pub duration_ms: i64,
    pub request_id: Option<String>,
    pub error: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Dedup ledger row for at-least-once event delivery (spec.md glossary).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CloudWatchLog {
    pub id: String,
    pub region: String,
    pub instance_id: String,
    pub state: String,
    pub generated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecentError {
    pub worker_type: String,
    pub time: DateTime<Utc>,
    pub region: String,
    pub code: String,
    pub message: String,
    pub instance_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCountBucket {
    pub instance_type: String,
    pub count: i64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCounts {
    pub pending: Vec<InstanceCountBucket>,
    pub running: Vec<InstanceCountBucket>,
}
