use crate::model::*;
use crate::CloudProvider;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory stand-in for the EC2 Query API, grounded in teacher's
/// `MockProvider` (a `CloudProvider` impl backed by ordinary state instead
/// of a live cloud call) but backed by a `Mutex`-guarded map instead of
/// Postgres — the reconciliation tests drive this directly without a
/// database.
///
/// Every region's state is independent; nothing here talks to the network.
#[derive(Default)]
pub struct MockProvider {
    regions: Mutex<HashMap<String, RegionState>>,
}

#[derive(Default)]
struct RegionState {
    instances: HashMap<String, DescribedInstance>,
    spot_requests: HashMap<String, DescribedSpotRequest>,
    key_pairs: HashMap<String, KeyPairInfo>,
    images: HashMap<String, DescribedImage>,
    volumes: Vec<DescribedVolume>,
    next_instance_seq: u64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_region<T>(&self, region: &str, f: impl FnOnce(&mut RegionState) -> T) -> T {
        let mut guard = self.regions.lock().unwrap();
        let state = guard.entry(region.to_string()).or_default();
        f(state)
    }

    /// Test hook: seed an instance directly into a region's view, as if the
    /// cloud already reported it this way.
    pub fn seed_instance(&self, region: &str, instance: DescribedInstance) {
        self.with_region(region, |s| {
            s.instances.insert(instance.instance_id.clone(), instance);
        });
    }

    /// Test hook: seed an outstanding spot request.
    pub fn seed_spot_request(&self, region: &str, request: DescribedSpotRequest) {
        self.with_region(region, |s| {
            s.spot_requests
                .insert(request.spot_instance_request_id.clone(), request);
        });
    }

    /// Test hook: seed a registered AMI with a given state.
    pub fn seed_image(&self, region: &str, image_id: &str, state: &str) {
        self.with_region(region, |s| {
            s.images.insert(
                image_id.to_string(),
                DescribedImage {
                    image_id: image_id.to_string(),
                    state: state.to_string(),
                },
            );
        });
    }

    /// Test hook: fulfil a spot request by materializing the instance it
    /// names and dropping the request, the way the real cloud would.
    pub fn fulfil_spot_request(&self, region: &str, request_id: &str, instance_id: &str) {
        self.with_region(region, |s| {
            if let Some(req) = s.spot_requests.remove(request_id) {
                s.instances.insert(
                    instance_id.to_string(),
                    DescribedInstance {
                        instance_id: instance_id.to_string(),
                        state: "pending".to_string(),
                        instance_type: req.instance_type,
                        image_id: req.image_id,
                        availability_zone: req.availability_zone,
                        key_name: None,
                        spot_instance_request_id: Some(request_id.to_string()),
                        launch_time: Utc::now(),
                        tags: Vec::new(),
                    },
                );
            }
        });
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn run_instances(&self, region: &str, req: &RunInstancesRequest) -> Result<Vec<String>> {
        Ok(self.with_region(region, |s| {
            let mut ids = Vec::with_capacity(req.max_count as usize);
            for _ in 0..req.max_count {
                s.next_instance_seq += 1;
                let id = format!("i-mock{:08x}", s.next_instance_seq);
                s.instances.insert(
                    id.clone(),
                    DescribedInstance {
                        instance_id: id.clone(),
                        state: "pending".to_string(),
                        instance_type: req.instance_type.clone(),
                        image_id: req.image_id.clone(),
                        availability_zone: req.availability_zone.clone(),
                        key_name: Some(req.key_name.clone()),
                        spot_instance_request_id: None,
                        launch_time: Utc::now(),
                        tags: req.tags.clone(),
                    },
                );
                ids.push(id);
            }
            ids
        }))
    }

    async fn describe_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedInstance>> {
        Ok(self.with_region(region, |s| {
            if ids.is_empty() {
                s.instances.values().cloned().collect()
            } else {
                ids.iter().filter_map(|id| s.instances.get(id).cloned()).collect()
            }
        }))
    }

    async fn describe_instances_by_key_prefix(
        &self,
        region: &str,
        key_prefix: &str,
        states: &[&str],
    ) -> Result<Vec<DescribedInstance>> {
        Ok(self.with_region(region, |s| {
            s.instances
                .values()
                .filter(|i| {
                    i.key_name
                        .as_deref()
                        .map(|k| k.starts_with(key_prefix))
                        .unwrap_or(false)
                        && states.contains(&i.state.as_str())
                })
                .cloned()
                .collect()
        }))
    }

    async fn describe_spot_instance_requests(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedSpotRequest>> {
        Ok(self.with_region(region, |s| {
            if ids.is_empty() {
                s.spot_requests.values().cloned().collect()
            } else {
                ids.iter()
                    .filter_map(|id| s.spot_requests.get(id).cloned())
                    .collect()
            }
        }))
    }

    async fn cancel_spot_instance_requests(&self, region: &str, ids: &[String]) -> Result<()> {
        self.with_region(region, |s| {
            for id in ids {
                if let Some(req) = s.spot_requests.get_mut(id) {
                    req.state = "cancelled".to_string();
                }
            }
        });
        Ok(())
    }

    async fn terminate_instances(&self, region: &str, ids: &[String]) -> Result<()> {
        self.with_region(region, |s| {
            for id in ids {
                if let Some(inst) = s.instances.get_mut(id) {
                    inst.state = "terminated".to_string();
                }
            }
        });
        Ok(())
    }

    async fn describe_terminated_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedTermination>> {
        Ok(self.with_region(region, |s| {
            ids.iter()
                .filter_map(|id| s.instances.get(id))
                .filter(|i| i.state == "terminated")
                .map(|i| DescribedTermination {
                    instance_id: i.instance_id.clone(),
                    state_reason: Some(StateReason {
                        code: "Client.UserInitiatedShutdown".to_string(),
                        message: "Client.UserInitiatedShutdown: User initiated".to_string(),
                    }),
                })
                .collect()
        }))
    }

    async fn describe_key_pairs(&self, region: &str, key_name: &str) -> Result<Vec<KeyPairInfo>> {
        Ok(self.with_region(region, |s| {
            s.key_pairs.get(key_name).cloned().into_iter().collect()
        }))
    }

    async fn import_key_pair(
        &self,
        region: &str,
        key_name: &str,
        _public_key_material: &[u8],
    ) -> Result<()> {
        self.with_region(region, |s| {
            s.key_pairs.insert(
                key_name.to_string(),
                KeyPairInfo {
                    key_name: key_name.to_string(),
                    key_fingerprint: format!("mock-fingerprint-{key_name}"),
                },
            );
        });
        Ok(())
    }

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()> {
        self.with_region(region, |s| {
            s.key_pairs.remove(key_name);
        });
        Ok(())
    }

    async fn create_tags(
        &self,
        region: &str,
        ids: &[String],
        tags: &[(String, String)],
    ) -> Result<()> {
        self.with_region(region, |s| {
            for id in ids {
                if let Some(inst) = s.instances.get_mut(id) {
                    for (k, v) in tags {
                        inst.tags.retain(|(ek, _)| ek != k);
                        inst.tags.push((k.clone(), v.clone()));
                    }
                }
            }
        });
        Ok(())
    }

    async fn describe_volumes(
        &self,
        region: &str,
        states: &[&str],
        _next_token: Option<String>,
    ) -> Result<Page<DescribedVolume>> {
        Ok(self.with_region(region, |s| Page {
            items: s
                .volumes
                .iter()
                .filter(|v| states.contains(&v.state.as_str()))
                .cloned()
                .collect(),
            next_token: None,
        }))
    }

    async fn describe_availability_zones(
        &self,
        region: &str,
    ) -> Result<Vec<DescribedAvailabilityZone>> {
        Ok(vec![DescribedAvailabilityZone {
            zone_name: format!("{region}a"),
            state: "available".to_string(),
        }])
    }

    async fn describe_spot_price_history(
        &self,
        region: &str,
        instance_types: &[String],
        availability_zone: Option<&str>,
    ) -> Result<Vec<SpotPricePoint>> {
        let az = availability_zone
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{region}a"));
        Ok(instance_types
            .iter()
            .map(|t| SpotPricePoint {
                instance_type: t.clone(),
                availability_zone: az.clone(),
                spot_price: "0.0500".to_string(),
                timestamp: Utc::now(),
            })
            .collect())
    }

    async fn describe_images(&self, region: &str, image_ids: &[String]) -> Result<Vec<DescribedImage>> {
        Ok(self.with_region(region, |s| {
            image_ids
                .iter()
                .filter_map(|id| s.images.get(id).cloned())
                .collect()
        }))
    }
}

/// Helper used by tests that expect `describe_key_pairs` on a missing key
/// to come back empty rather than erroring, matching `Ec2Provider`'s
/// `InvalidKeyPair.NotFound` handling.
pub fn key_pair_not_found_error(key_name: &str) -> anyhow::Error {
    anyhow!("InvalidKeyPair.NotFound: key pair {key_name} not found")
}
