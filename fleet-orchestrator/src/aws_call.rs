use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use fleet_common::error::FleetError;
use fleet_common::types::AwsRequestLog;
use serde_json::Value;
use uuid::Uuid;

use crate::store::Store;

/// A small allowlist of methods whose metadata is worth recording alongside
/// the bare call shape — `run_instances` is the one every reconciliation
/// loop actually inspects after the fact when a fleet looks wrong.
pub struct CallMetadata {
    pub worker_type: Option<String>,
    pub availability_zone: Option<String>,
    pub instance_type: Option<String>,
    pub image_id: Option<String>,
}

impl CallMetadata {
    pub fn none() -> Self {
        Self {
            worker_type: None,
            availability_zone: None,
            instance_type: None,
            image_id: None,
        }
    }

    fn to_json(&self) -> Option<Value> {
        if self.worker_type.is_none()
            && self.availability_zone.is_none()
            && self.instance_type.is_none()
            && self.image_id.is_none()
        {
            return None;
        }
        Some(serde_json::json!({
            "workerType": self.worker_type,
            "availabilityZone": self.availability_zone,
            "instanceType": self.instance_type,
            "imageId": self.image_id,
        }))
    }
}

/// Wraps a cloud call with a deadline and an unconditional audit write.
///
/// Bounded by `max_duration` via `tokio::time::timeout`; whichever way the
/// call exits — success, cloud error, or deadline — exactly one row lands in
/// `aws_request_log`, the same open/close discipline teacher's
/// `log_event`/`log_event_complete` pairing gives `action_logs`, collapsed
/// to a single write because the duration is already known by the time we
/// have anything to log.
pub async fn aws_call<F, T>(
    store: &Store,
    region: &str,
    service: &str,
    method: &str,
    max_duration: Duration,
    metadata: CallMetadata,
    f: F,
) -> Result<T, FleetError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let called = Utc::now();
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(max_duration, f).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let (result, error, code, message) = match outcome {
        Ok(Ok(value)) => (Ok(value), false, None, None),
        Ok(Err(e)) => (
            Err(FleetError::CloudRequest {
                code: "CloudError".to_string(),
                message: e.to_string(),
            }),
            true,
            Some("CloudError".to_string()),
            Some(e.to_string()),
        ),
        Err(_) => (
            Err(FleetError::CloudTimeout(max_duration)),
            true,
            Some("Timeout".to_string()),
            Some(format!("exceeded {max_duration:?}")),
        ),
    };

    let log = AwsRequestLog {
        id: Uuid::new_v4(),
        region: region.to_string(),
        service: service.to_string(),
        method: method.to_string(),
        called,
        duration_ms,
        request_id: None,
        error,
        code,
        message,
        metadata: metadata.to_json(),
    };

    if let Err(log_err) = store.log_aws_request(&log).await {
        tracing::warn!(error = %log_err, %region, %service, %method, "failed to write AWS call audit row");
    }

    result
}
