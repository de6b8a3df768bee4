use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel name for a region's instance-state-change stream. One Redis
/// Pub/Sub channel per region, mirroring teacher's single `CHANNEL_FINOPS_EVENTS`
/// constant generalized to a per-region name since the Event Ingestor runs
/// one subscriber task per configured region.
pub fn instance_events_channel(region: &str) -> String {
    format!("fleet:instance-events:{region}")
}

/// Envelope published onto a region's channel whenever the cloud reports an
/// instance state change — the wire shape the Event Ingestor deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEventEnvelope {
    /// Cloud-assigned id for this notification, used as the dedup key in
    /// `cloudwatch_log` so at-least-once delivery doesn't double-apply.
    pub event_id: String,
    pub region: String,
    pub instance_id: String,
    pub state: String,
    pub generated: DateTime<Utc>,
}

impl InstanceEventEnvelope {
    pub fn new(
        event_id: impl Into<String>,
        region: impl Into<String>,
        instance_id: impl Into<String>,
        state: impl Into<String>,
        generated: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            region: region.into(),
            instance_id: instance_id.into(),
            state: state.into(),
            generated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_is_region_scoped() {
        assert_eq!(
            instance_events_channel("us-west-2"),
            "fleet:instance-events:us-west-2"
        );
    }
}
