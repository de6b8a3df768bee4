use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "live")]
pub mod ec2;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "live")]
pub use ec2::Ec2Provider;

#[cfg(feature = "mock")]
pub use mock::MockProvider;

/// One EC2 service call's worth of input/output shapes, grouped by the
/// operation that produces or consumes them (teacher's `inventory` module
/// groups its Scaleway shapes the same way, one sub-namespace per concern).
pub mod model {
    use super::*;

    #[derive(Clone, Debug)]
    pub struct RunInstancesRequest {
        pub availability_zone: String,
        pub instance_type: String,
        pub image_id: String,
        pub key_name: String,
        pub min_count: u32,
        pub max_count: u32,
        pub spot: bool,
        pub spot_max_price: Option<String>,
        pub tags: Vec<(String, String)>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DescribedInstance {
        pub instance_id: String,
        pub state: String,
        pub instance_type: String,
        pub image_id: String,
        pub availability_zone: String,
        pub key_name: Option<String>,
        pub spot_instance_request_id: Option<String>,
        pub launch_time: DateTime<Utc>,
        pub tags: Vec<(String, String)>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct StateReason {
        pub code: String,
        pub message: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DescribedTermination {
        pub instance_id: String,
        pub state_reason: Option<StateReason>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DescribedSpotRequest {
        pub spot_instance_request_id: String,
        pub state: String,
        pub status_code: String,
        pub instance_type: String,
        pub availability_zone: String,
        pub image_id: String,
        pub create_time: DateTime<Utc>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct KeyPairInfo {
        pub key_name: String,
        pub key_fingerprint: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DescribedVolume {
        pub volume_id: String,
        pub volume_type: String,
        pub state: String,
        pub size_gb: i64,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DescribedAvailabilityZone {
        pub zone_name: String,
        pub state: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct SpotPricePoint {
        pub instance_type: String,
        pub availability_zone: String,
        pub spot_price: String,
        pub timestamp: DateTime<Utc>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DescribedImage {
        pub image_id: String,
        pub state: String,
    }

    #[derive(Clone, Debug, Default)]
    pub struct Page<T> {
        pub items: Vec<T>,
        pub next_token: Option<String>,
    }
}

use model::*;

/// Abstraction over the subset of the EC2 Query API the fleet manager
/// calls. One "real" implementation (`ec2::Ec2Provider`, reqwest-based
/// against the EC2 endpoint) and one `MockProvider` for tests — the same
/// split teacher draws between `ScalewayProvider` and its `mock` module,
/// renamed `live`/`mock`.
///
/// Every method returns `anyhow::Result` rather than a typed error: callers
/// (`AWSCall`) are the ones that need a structured `code`/`message`, which
/// they extract from the error's `Display` and the `CloudError` downcast
/// providers are expected to produce on failure.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn run_instances(&self, region: &str, req: &RunInstancesRequest) -> Result<Vec<String>>;

    async fn describe_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedInstance>>;

    async fn describe_instances_by_key_prefix(
        &self,
        region: &str,
        key_prefix: &str,
        states: &[&str],
    ) -> Result<Vec<DescribedInstance>>;

    async fn describe_spot_instance_requests(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedSpotRequest>>;

    async fn cancel_spot_instance_requests(&self, region: &str, ids: &[String]) -> Result<()>;

    async fn terminate_instances(&self, region: &str, ids: &[String]) -> Result<()>;

    async fn describe_terminated_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedTermination>>;

    async fn describe_key_pairs(&self, region: &str, key_name: &str) -> Result<Vec<KeyPairInfo>>;

    async fn import_key_pair(
        &self,
        region: &str,
        key_name: &str,
        public_key_material: &[u8],
    ) -> Result<()>;

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()>;

    async fn create_tags(
        &self,
        region: &str,
        ids: &[String],
        tags: &[(String, String)],
    ) -> Result<()>;

    async fn describe_volumes(
        &self,
        region: &str,
        states: &[&str],
        next_token: Option<String>,
    ) -> Result<Page<DescribedVolume>>;

    async fn describe_availability_zones(
        &self,
        region: &str,
    ) -> Result<Vec<DescribedAvailabilityZone>>;

    async fn describe_spot_price_history(
        &self,
        region: &str,
        instance_types: &[String],
        availability_zone: Option<&str>,
    ) -> Result<Vec<SpotPricePoint>>;

    async fn describe_images(&self, region: &str, image_ids: &[String]) -> Result<Vec<DescribedImage>>;
}

/// Parses the `<prefix>:<workerType>:<hash>` key-name convention event
/// ingest and the housekeeper both rely on to recover a worker type from a
/// bare EC2 key-name string. Lives outside both provider implementations
/// since callers need it regardless of which `CloudProvider` is active.
pub fn worker_type_from_key_name(key_name: &str) -> Option<&str> {
    let mut parts = key_name.splitn(3, ':');
    let _prefix = parts.next()?;
    parts.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_type_out_of_key_name() {
        assert_eq!(worker_type_from_key_name("pfx:wt:abc"), Some("wt"));
        assert_eq!(worker_type_from_key_name("onlyprefix"), None);
    }
}
