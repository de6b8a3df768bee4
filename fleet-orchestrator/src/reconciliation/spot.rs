use std::sync::Arc;
use std::time::Duration;

use fleet_common::types::{SpotRequestState, SpotRequestStatus};
use fleet_providers::CloudProvider;

use crate::aws_call::{self, CallMetadata};
use crate::iterator::Watchdog;
use crate::store::Store;

const BATCH_SIZE: usize = 100;

/// One iteration of spec.md §4.5's spot-request poller for a single region.
/// Plugged into a `PeriodicLoop` per configured region by `main.rs`.
pub async fn poll_region(
    store: &Store,
    provider: &dyn CloudProvider,
    region: &str,
    cloud_call_timeout: Duration,
    watchdog: &Watchdog,
) -> anyhow::Result<()> {
    let ids = store.spot_requests_to_poll(region).await?;
    if ids.is_empty() {
        return Ok(());
    }

    for batch in ids.chunks(BATCH_SIZE) {
        watchdog.touch();
        let described = aws_call::aws_call(
            store,
            region,
            "ec2",
            "describe_spot_instance_requests",
            cloud_call_timeout,
            CallMetadata::none(),
            async { provider.describe_spot_instance_requests(region, &batch.to_vec()).await },
        )
        .await?;

        let mut to_cancel = Vec::new();
        for r in &described {
            let status = SpotRequestStatus::new(r.status_code.clone());
            match r.state.as_str() {
                "open" if status.is_pending() => {
                    store
                        .update_spot_request_state(
                            region,
                            &r.spot_instance_request_id,
                            SpotRequestState::Open,
                            &status,
                        )
                        .await?;
                }
                "open" => to_cancel.push(r.spot_instance_request_id.clone()),
                _ => {
                    // No longer actionable. If this fulfilled into an
                    // instance, that row arrives via the Event Ingestor, not
                    // here — the poller's job ends at dropping the request.
                    store
                        .remove_spot_request(region, &r.spot_instance_request_id)
                        .await?;
                }
            }
        }

        if !to_cancel.is_empty() {
            let cancel = aws_call::aws_call(
                store,
                region,
                "ec2",
                "cancel_spot_instance_requests",
                cloud_call_timeout,
                CallMetadata::none(),
                async { provider.cancel_spot_instance_requests(region, &to_cancel).await },
            )
            .await;
            match cancel {
                Ok(()) => {
                    for id in &to_cancel {
                        store.remove_spot_request(region, id).await?;
                    }
                }
                Err(e) => {
                    tracing::warn!(%region, error = %e, "cancel_spot_instance_requests failed, retrying next tick");
                }
            }
        }
    }

    Ok(())
}

/// Polls every configured region serially within one iteration; a failure
/// in one region is logged and does not stop the others (spec.md §4.6 point
/// 5 applies the same non-fatal-per-region rule across the pollers).
pub fn handler(
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    regions: Vec<String>,
    cloud_call_timeout: Duration,
) -> impl FnMut(Watchdog) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
{
    move |watchdog: Watchdog| {
        let store = store.clone();
        let provider = provider.clone();
        let regions = regions.clone();
        Box::pin(async move {
            for region in &regions {
                if let Err(e) =
                    poll_region(&store, provider.as_ref(), region, cloud_call_timeout, &watchdog).await
                {
                    tracing::warn!(%region, error = %e, "spot-request poll failed for region");
                }
            }
            Ok(())
        })
    }
}
