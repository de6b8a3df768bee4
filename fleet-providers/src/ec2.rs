use crate::model::*;
use crate::CloudProvider;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::types::{
    Filter as Ec2Filter, InstanceType as Ec2InstanceType, ResourceType, Tag, TagSpecification,
};
use aws_sdk_ec2::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One `aws-sdk-ec2` client per region — regions never share a connection,
/// matching teacher's `ScalewayProvider` holding one `reqwest::Client`
/// scoped to a single zone-agnostic endpoint. Here the per-region split is
/// real (each EC2 region is a distinct endpoint), so the map is keyed on
/// region name and built lazily the first time a region is touched.
pub struct Ec2Provider {
    clients: tokio::sync::RwLock<HashMap<String, Client>>,
}

impl Ec2Provider {
    pub fn new() -> Self {
        Self {
            clients: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, region: &str) -> Client {
        if let Some(c) = self.clients.read().await.get(region) {
            return c.clone();
        }
        let shared = aws_config::from_env()
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        let client = Client::new(&shared);
        self.clients
            .write()
            .await
            .insert(region.to_string(), client.clone());
        client
    }
}

impl Default for Ec2Provider {
    fn default() -> Self {
        Self::new()
    }
}

fn to_described_instance(inst: &aws_sdk_ec2::types::Instance) -> DescribedInstance {
    let tags: Vec<(String, String)> = inst
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect();
    DescribedInstance {
        instance_id: inst.instance_id().unwrap_or_default().to_string(),
        state: inst
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string())
            .unwrap_or_default(),
        instance_type: inst
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        image_id: inst.image_id().unwrap_or_default().to_string(),
        availability_zone: inst
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        key_name: inst.key_name().map(|s| s.to_string()),
        spot_instance_request_id: inst.spot_instance_request_id().map(|s| s.to_string()),
        launch_time: inst
            .launch_time()
            .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
            .unwrap_or_else(Utc::now),
        tags,
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    async fn run_instances(&self, region: &str, req: &RunInstancesRequest) -> Result<Vec<String>> {
        let client = self.client_for(region).await;
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(
                req.tags
                    .iter()
                    .map(|(k, v)| Tag::builder().key(k).value(v).build())
                    .collect(),
            ))
            .build();

        let mut builder = client
            .run_instances()
            .image_id(&req.image_id)
            .instance_type(Ec2InstanceType::from(req.instance_type.as_str()))
            .key_name(&req.key_name)
            .min_count(req.min_count as i32)
            .max_count(req.max_count as i32)
            .placement(
                aws_sdk_ec2::types::Placement::builder()
                    .availability_zone(&req.availability_zone)
                    .build(),
            )
            .tag_specifications(tag_spec);

        if req.spot {
            let mut market = aws_sdk_ec2::types::SpotMarketOptions::builder();
            if let Some(price) = &req.spot_max_price {
                market = market.max_price(price);
            }
            builder = builder.instance_market_options(
                aws_sdk_ec2::types::InstanceMarketOptionsRequest::builder()
                    .market_type(aws_sdk_ec2::types::MarketType::Spot)
                    .spot_options(market.build())
                    .build(),
            );
        }

        let out = builder.send().await.context("run_instances")?;
        Ok(out
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(|s| s.to_string()))
            .collect())
    }

    async fn describe_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedInstance>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .context("describe_instances")?;
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(to_described_instance)
            .collect())
    }

    async fn describe_instances_by_key_prefix(
        &self,
        region: &str,
        key_prefix: &str,
        states: &[&str],
    ) -> Result<Vec<DescribedInstance>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_instances()
            .filters(
                Ec2Filter::builder()
                    .name("key-name")
                    .values(format!("{key_prefix}*"))
                    .build(),
            )
            .filters(
                Ec2Filter::builder()
                    .name("instance-state-name")
                    .set_values(Some(states.iter().map(|s| s.to_string()).collect()))
                    .build(),
            )
            .send()
            .await
            .context("describe_instances_by_key_prefix")?;
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(to_described_instance)
            .collect())
    }

    async fn describe_spot_instance_requests(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedSpotRequest>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .context("describe_spot_instance_requests")?;
        Ok(out
            .spot_instance_requests()
            .iter()
            .map(|r| DescribedSpotRequest {
                spot_instance_request_id: r.spot_instance_request_id().unwrap_or_default().to_string(),
                state: r
                    .state()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                status_code: r
                    .status()
                    .and_then(|s| s.code())
                    .unwrap_or_default()
                    .to_string(),
                instance_type: r
                    .launch_specification()
                    .and_then(|ls| ls.instance_type())
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
                availability_zone: r
                    .launched_availability_zone()
                    .unwrap_or_default()
                    .to_string(),
                image_id: r
                    .launch_specification()
                    .and_then(|ls| ls.image_id())
                    .unwrap_or_default()
                    .to_string(),
                create_time: r
                    .create_time()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn cancel_spot_instance_requests(&self, region: &str, ids: &[String]) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .context("cancel_spot_instance_requests")?;
        Ok(())
    }

    async fn terminate_instances(&self, region: &str, ids: &[String]) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .context("terminate_instances")?;
        Ok(())
    }

    async fn describe_terminated_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<DescribedTermination>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .context("describe_terminated_instances")?;
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(|i| DescribedTermination {
                instance_id: i.instance_id().unwrap_or_default().to_string(),
                state_reason: i.state_reason().map(|sr| StateReason {
                    code: sr.code().unwrap_or_default().to_string(),
                    message: sr.message().unwrap_or_default().to_string(),
                }),
            })
            .collect())
    }

    async fn describe_key_pairs(&self, region: &str, key_name: &str) -> Result<Vec<KeyPairInfo>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_key_pairs()
            .key_names(key_name)
            .send()
            .await;
        // A nonexistent key pair is not an error condition this call needs
        // to surface — callers use an empty result to decide whether to
        // import. Every other failure propagates.
        let out = match out {
            Ok(o) => o,
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("InvalidKeyPair.NotFound") {
                    return Ok(Vec::new());
                }
                return Err(anyhow!(msg)).context("describe_key_pairs");
            }
        };
        Ok(out
            .key_pairs()
            .iter()
            .map(|k| KeyPairInfo {
                key_name: k.key_name().unwrap_or_default().to_string(),
                key_fingerprint: k.key_fingerprint().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn import_key_pair(
        &self,
        region: &str,
        key_name: &str,
        public_key_material: &[u8],
    ) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .import_key_pair()
            .key_name(key_name)
            .public_key_material(aws_sdk_ec2::primitives::Blob::new(public_key_material))
            .send()
            .await
            .context("import_key_pair")?;
        Ok(())
    }

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .delete_key_pair()
            .key_name(key_name)
            .send()
            .await
            .context("delete_key_pair")?;
        Ok(())
    }

    async fn create_tags(
        &self,
        region: &str,
        ids: &[String],
        tags: &[(String, String)],
    ) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .create_tags()
            .set_resources(Some(ids.to_vec()))
            .set_tags(Some(
                tags.iter()
                    .map(|(k, v)| Tag::builder().key(k).value(v).build())
                    .collect(),
            ))
            .send()
            .await
            .context("create_tags")?;
        Ok(())
    }

    async fn describe_volumes(
        &self,
        region: &str,
        states: &[&str],
        next_token: Option<String>,
    ) -> Result<Page<DescribedVolume>> {
        let client = self.client_for(region).await;
        let mut req = client.describe_volumes().filters(
            Ec2Filter::builder()
                .name("status")
                .set_values(Some(states.iter().map(|s| s.to_string()).collect()))
                .build(),
        );
        if let Some(token) = next_token {
            req = req.next_token(token);
        }
        let out = req.send().await.context("describe_volumes")?;
        Ok(Page {
            items: out
                .volumes()
                .iter()
                .map(|v| DescribedVolume {
                    volume_id: v.volume_id().unwrap_or_default().to_string(),
                    volume_type: v
                        .volume_type()
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                    state: v.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
                    size_gb: v.size().unwrap_or_default() as i64,
                })
                .collect(),
            next_token: out.next_token().map(|s| s.to_string()),
        })
    }

    async fn describe_availability_zones(
        &self,
        region: &str,
    ) -> Result<Vec<DescribedAvailabilityZone>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_availability_zones()
            .send()
            .await
            .context("describe_availability_zones")?;
        Ok(out
            .availability_zones()
            .iter()
            .map(|z| DescribedAvailabilityZone {
                zone_name: z.zone_name().unwrap_or_default().to_string(),
                state: z.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
            })
            .collect())
    }

    async fn describe_spot_price_history(
        &self,
        region: &str,
        instance_types: &[String],
        availability_zone: Option<&str>,
    ) -> Result<Vec<SpotPricePoint>> {
        let client = self.client_for(region).await;
        let types: Vec<Ec2InstanceType> = instance_types
            .iter()
            .map(|t| Ec2InstanceType::from(t.as_str()))
            .collect();
        let mut req = client
            .describe_spot_price_history()
            .set_instance_types(Some(types))
            .start_time(aws_sdk_ec2::primitives::DateTime::from_secs(
                Utc::now().timestamp(),
            ));
        if let Some(az) = availability_zone {
            req = req.availability_zone(az);
        }
        let out = req.send().await.context("describe_spot_price_history")?;
        Ok(out
            .spot_price_history()
            .iter()
            .map(|p| SpotPricePoint {
                instance_type: p
                    .instance_type()
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
                availability_zone: p.availability_zone().unwrap_or_default().to_string(),
                spot_price: p.spot_price().unwrap_or_default().to_string(),
                timestamp: p
                    .timestamp()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn describe_images(&self, region: &str, image_ids: &[String]) -> Result<Vec<DescribedImage>> {
        let client = self.client_for(region).await;
        let out = client
            .describe_images()
            .set_image_ids(Some(image_ids.to_vec()))
            .send()
            .await
            .context("describe_images")?;
        Ok(out
            .images()
            .iter()
            .map(|i| DescribedImage {
                image_id: i.image_id().unwrap_or_default().to_string(),
                state: i.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
            })
            .collect())
    }
}

