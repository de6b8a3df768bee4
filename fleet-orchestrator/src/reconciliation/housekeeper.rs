use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_common::filter::Filter;
use fleet_common::types::{Instance, InstanceState, Termination};
use fleet_providers::worker_type_from_key_name;
use fleet_providers::CloudProvider;
use futures_util::future::join_all;

use crate::aws_call::{self, CallMetadata};
use crate::iterator::Watchdog;
use crate::store::Store;
use crate::tagger;

#[derive(Debug, Clone, Default)]
pub struct HousekeeperOutcome {
    pub missing_instances: usize,
    pub extraneous_instances: usize,
    pub zombies: Vec<String>,
}

/// spec.md §4.8's full sweep for one region. Steps run in the documented
/// order: zombie termination precedes extraneous cleanup so housekeeper
/// doesn't race its own terminations (a zombie just killed this tick must
/// not also get flagged extraneous on the very same pass).
pub async fn reconcile_region(
    store: &Store,
    provider: &dyn CloudProvider,
    region: &str,
    key_prefix: &str,
    manager_id: &str,
    max_instance_life_hours: i64,
    cloud_call_timeout: Duration,
    watchdog: &Watchdog,
) -> anyhow::Result<HousekeeperOutcome> {
    watchdog.touch();

    let local = store
        .list_instances(&Filter::new().eq("region", region))
        .await?;
    let mut local_ids: HashSet<String> = local.into_iter().map(|i| i.id).collect();

    let cloud = aws_call::aws_call(
        store,
        region,
        "ec2",
        "describe_instances_by_key_prefix",
        cloud_call_timeout,
        CallMetadata::none(),
        async { provider.describe_instances_by_key_prefix(region, key_prefix, &["pending", "running"]).await },
    )
    .await?;

    let now = Utc::now();
    let life_limit = chrono::Duration::hours(max_instance_life_hours);

    let mut zombies = Vec::new();
    let mut valid_cloud_ids = HashSet::new();
    let mut tag_queue: HashMap<String, Vec<String>> = HashMap::new();
    let mut missing_instances = 0usize;

    for inst in &cloud {
        let worker_type = inst
            .key_name
            .as_deref()
            .and_then(worker_type_from_key_name)
            .unwrap_or("unknown")
            .to_string();

        if !inst.tags.iter().any(|(k, _)| k == "Owner") {
            tag_queue
                .entry(worker_type.clone())
                .or_default()
                .push(inst.instance_id.clone());
        }

        if now - inst.launch_time > life_limit {
            zombies.push(inst.clone());
            continue;
        }

        valid_cloud_ids.insert(inst.instance_id.clone());
        if !local_ids.contains(&inst.instance_id) {
            let row = Instance {
                region: region.to_string(),
                id: inst.instance_id.clone(),
                worker_type,
                availability_zone: inst.availability_zone.clone(),
                instance_type: inst.instance_type.clone(),
                state: if inst.state == "running" {
                    InstanceState::Running
                } else {
                    InstanceState::Pending
                },
                image_id: inst.image_id.clone(),
                launched: inst.launch_time,
                last_event: now,
                source_request_id: inst.spot_instance_request_id.clone(),
            };
            store.upsert_instance(&row).await?;
            if let Err(e) = store.report_ami_usage(region, &inst.image_id).await {
                tracing::warn!(%region, ami_id = %inst.image_id, error = %e, "failed to record AMI usage");
            }
            local_ids.insert(inst.instance_id.clone());
            missing_instances += 1;
        }
    }

    let mut outcome = HousekeeperOutcome {
        missing_instances,
        ..Default::default()
    };

    if !zombies.is_empty() {
        let zombie_ids: Vec<String> = zombies.iter().map(|z| z.instance_id.clone()).collect();
        let terminate = aws_call::aws_call(
            store,
            region,
            "ec2",
            "terminate_instances",
            cloud_call_timeout,
            CallMetadata::none(),
            async { provider.terminate_instances(region, &zombie_ids).await },
        )
        .await;
        match terminate {
            Ok(()) => {
                for z in &zombies {
                    let worker_type = z
                        .key_name
                        .as_deref()
                        .and_then(worker_type_from_key_name)
                        .unwrap_or("unknown")
                        .to_string();
                    let termination = Termination {
                        region: region.to_string(),
                        id: z.instance_id.clone(),
                        worker_type,
                        availability_zone: z.availability_zone.clone(),
                        instance_type: z.instance_type.clone(),
                        image_id: z.image_id.clone(),
                        launched: z.launch_time,
                        terminated: now,
                        code: None,
                        reason: None,
                        last_event: now,
                    };
                    if let Err(e) = store.insert_termination(&termination).await {
                        tracing::warn!(%region, instance_id = %z.instance_id, error = %e, "failed to record zombie termination");
                    }
                    if let Err(e) = store.remove_instance(region, &z.instance_id).await {
                        tracing::warn!(%region, instance_id = %z.instance_id, error = %e, "failed to drop zombie instance row");
                    }
                    local_ids.remove(&z.instance_id);
                }
                outcome.zombies = zombie_ids;
            }
            Err(e) => {
                tracing::warn!(%region, error = %e, "zombie terminate_instances failed, retried next tick");
            }
        }
    }

    for id in &local_ids {
        if !valid_cloud_ids.contains(id) {
            store.remove_instance(region, id).await?;
            outcome.extraneous_instances += 1;
        }
    }

    for (worker_type, ids) in tag_queue {
        let tag_result = aws_call::aws_call(
            store,
            region,
            "ec2",
            "create_tags",
            cloud_call_timeout,
            CallMetadata::none(),
            async { tagger::tag_resources(provider, region, &ids, &worker_type, manager_id).await },
        )
        .await;
        if let Err(e) = tag_result {
            tracing::warn!(%region, %worker_type, error = %e, "tagging pass failed");
        }
    }

    if let Err(e) = account_ebs_usage(store, provider, region, cloud_call_timeout).await {
        tracing::warn!(%region, error = %e, "EBS accounting pass failed");
    }

    Ok(outcome)
}

/// Optional step 7: page through `describeVolumes` and aggregate counts/size
/// by (region, volumeType, state) into `ebs_usage`.
async fn account_ebs_usage(
    store: &Store,
    provider: &dyn CloudProvider,
    region: &str,
    cloud_call_timeout: Duration,
) -> anyhow::Result<()> {
    let mut totals: HashMap<(String, String), (i64, i64)> = HashMap::new();
    let mut next_token = None;

    loop {
        let page = aws_call::aws_call(
            store,
            region,
            "ec2",
            "describe_volumes",
            cloud_call_timeout,
            CallMetadata::none(),
            {
                let next_token = next_token.clone();
                async move { provider.describe_volumes(region, &["available", "in-use"], next_token).await }
            },
        )
        .await?;
        for v in &page.items {
            let entry = totals.entry((v.volume_type.clone(), v.state.clone())).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += v.size_gb;
        }
        next_token = page.next_token;
        if next_token.is_none() {
            break;
        }
    }

    for ((volume_type, state), (count, gb)) in totals {
        store
            .upsert_ebs_usage(region, &volume_type, &state, count, gb)
            .await?;
    }
    Ok(())
}

/// Runs every configured region concurrently, per spec.md §4.8 point 8.
pub async fn sweep_all_regions(
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    regions: &[String],
    key_prefix: &str,
    manager_id: &str,
    max_instance_life_hours: i64,
    cloud_call_timeout: Duration,
    watchdog: &Watchdog,
) {
    let tasks = regions.iter().map(|region| {
        let store = store.clone();
        let provider = provider.clone();
        let region = region.clone();
        let key_prefix = key_prefix.to_string();
        let manager_id = manager_id.to_string();
        let watchdog = watchdog.clone();
        async move {
            if let Err(e) = reconcile_region(
                &store,
                provider.as_ref(),
                &region,
                &key_prefix,
                &manager_id,
                max_instance_life_hours,
                cloud_call_timeout,
                &watchdog,
            )
            .await
            {
                tracing::warn!(%region, error = %e, "housekeeper sweep failed for region");
            }
        }
    });
    join_all(tasks).await;
}

pub fn handler(
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    regions: Vec<String>,
    key_prefix: String,
    manager_id: String,
    max_instance_life_hours: i64,
    cloud_call_timeout: Duration,
) -> impl FnMut(Watchdog) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
{
    move |watchdog: Watchdog| {
        let store = store.clone();
        let provider = provider.clone();
        let regions = regions.clone();
        let key_prefix = key_prefix.clone();
        let manager_id = manager_id.clone();
        Box::pin(async move {
            sweep_all_regions(
                store,
                provider,
                &regions,
                &key_prefix,
                &manager_id,
                max_instance_life_hours,
                cloud_call_timeout,
                &watchdog,
            )
            .await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::Watchdog;
    use crate::store::Store;
    use fleet_providers::model::{DescribedInstance, RunInstancesRequest};
    use fleet_providers::MockProvider;

    fn fresh_instance(id: &str) -> DescribedInstance {
        DescribedInstance {
            instance_id: id.to_string(),
            state: "running".to_string(),
            instance_type: "m5.large".to_string(),
            image_id: "ami-1".to_string(),
            availability_zone: "us-east-1a".to_string(),
            key_name: Some("pfx:wt:abc".to_string()),
            spot_instance_request_id: None,
            launch_time: Utc::now(),
            tags: vec![("Owner".to_string(), "fleet-manager".to_string())],
        }
    }

    #[tokio::test]
    async fn missing_add_creates_instance_row_with_parsed_worker_type() {
        let store = Store::new(Store::new_test_pool().await);
        let provider = MockProvider::new();
        provider.seed_instance("us-east-1", fresh_instance("i-1"));

        let outcome = reconcile_region(
            &store,
            &provider,
            "us-east-1",
            "pfx",
            "fleet-manager",
            24,
            Duration::from_secs(5),
            &Watchdog::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.missing_instances, 1);
        let instances = store
            .list_instances(&Filter::new().eq("region", "us-east-1"))
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].worker_type, "wt");
    }

    #[tokio::test]
    async fn run_instances_without_owner_tag_are_queued_for_tagging() {
        let provider = MockProvider::new();
        let ids = provider
            .run_instances(
                "us-east-1",
                &RunInstancesRequest {
                    availability_zone: "us-east-1a".into(),
                    instance_type: "m5.large".into(),
                    image_id: "ami-1".into(),
                    key_name: "pfx:wt:abc".into(),
                    min_count: 1,
                    max_count: 1,
                    spot: false,
                    spot_max_price: None,
                    tags: Vec::new(),
                },
            )
            .await
            .unwrap();
        let described = provider.describe_instances("us-east-1", &ids).await.unwrap();
        assert!(!described[0].tags.iter().any(|(k, _)| k == "Owner"));
    }
}
