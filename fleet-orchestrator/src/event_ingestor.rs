use std::sync::Arc;
use std::time::Duration;

use fleet_common::queue::{instance_events_channel, InstanceEventEnvelope};
use fleet_common::types::InstanceState;
use fleet_providers::worker_type_from_key_name;
use fleet_providers::CloudProvider;
use futures_util::StreamExt;
use tokio::sync::Semaphore;

use crate::store::Store;

/// At most this many event-ingest messages are being applied to the store
/// concurrently within one region, bounding how much work a burst of
/// notifications can push onto the pool at once.
const MAX_CONCURRENT_MESSAGES: usize = 10;

/// Subscribes to one region's instance-event channel for the process
/// lifetime. Each delivered message is deduplicated via `cloudwatch_log`
/// before anything else happens to it — at-least-once delivery in, at-most-
/// once effect out, the dedup-ledger pattern spec.md calls for.
pub async fn run(
    redis_client: redis::Client,
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    region: String,
) -> anyhow::Result<()> {
    let channel = instance_events_channel(&region);
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_MESSAGES));

    loop {
        match subscribe_and_drain(&redis_client, &channel, &region, &store, &provider, &semaphore)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(%region, error = %e, "event ingestor subscription dropped, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn subscribe_and_drain(
    redis_client: &redis::Client,
    channel: &str,
    region: &str,
    store: &Arc<Store>,
    provider: &Arc<dyn CloudProvider>,
    semaphore: &Arc<Semaphore>,
) -> anyhow::Result<()> {
    let mut pubsub = redis_client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    let mut stream = pubsub.on_message();

    while let Some(msg) = stream.next().await {
        let payload: String = msg.get_payload()?;
        let store = store.clone();
        let provider = provider.clone();
        let region = region.to_string();
        let permit = semaphore.clone().acquire_owned().await?;

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = apply_event(&store, &provider, &region, &payload).await {
                tracing::warn!(%region, error = %e, "failed to apply instance event");
            }
        });
    }

    anyhow::bail!("pubsub stream for {channel} ended")
}

async fn apply_event(
    store: &Store,
    provider: &Arc<dyn CloudProvider>,
    region: &str,
    payload: &str,
) -> anyhow::Result<()> {
    let envelope: InstanceEventEnvelope = serde_json::from_str(payload)?;

    match store
        .log_cloudwatch_event(
            &envelope.event_id,
            &envelope.region,
            &envelope.instance_id,
            &envelope.state,
            envelope.generated,
        )
        .await
    {
        Ok(()) => {}
        Err(e) if matches!(e, fleet_common::error::FleetError::Dedup) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    if envelope.state == "pending" || envelope.state == "running" {
        let described = provider
            .describe_instances(region, &[envelope.instance_id.clone()])
            .await?;
        let Some(inst) = described.into_iter().next() else {
            return Ok(());
        };

        let worker_type = inst
            .key_name
            .as_deref()
            .and_then(worker_type_from_key_name)
            .unwrap_or("unknown")
            .to_string();

        let state = if envelope.state == "running" {
            InstanceState::Running
        } else {
            InstanceState::Pending
        };

        let row = fleet_common::types::Instance {
            region: region.to_string(),
            id: inst.instance_id,
            worker_type,
            availability_zone: inst.availability_zone,
            instance_type: inst.instance_type,
            state,
            image_id: inst.image_id,
            launched: inst.launch_time,
            last_event: envelope.generated,
            source_request_id: inst.spot_instance_request_id,
        };
        store.upsert_instance(&row).await?;
    } else {
        store
            .remove_instance(region, &envelope.instance_id)
            .await?;
    }

    Ok(())
}
