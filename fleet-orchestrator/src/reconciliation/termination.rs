use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_common::types::{classify_termination, TerminationClass};
use fleet_providers::CloudProvider;

use crate::aws_call::{self, CallMetadata};
use crate::iterator::Watchdog;
use crate::store::{Store, TerminationPollItem};

const POLL_LIMIT: i64 = 200;

/// spec.md §4.6's termination poller, one iteration.
pub async fn poll_once(
    store: &Store,
    provider: &dyn CloudProvider,
    cloud_call_timeout: Duration,
    watchdog: &Watchdog,
) -> anyhow::Result<()> {
    let to_poll = store.find_terminations_to_poll(POLL_LIMIT).await?;
    if to_poll.is_empty() {
        return Ok(());
    }

    let mut by_region: HashMap<String, Vec<TerminationPollItem>> = HashMap::new();
    for item in to_poll {
        by_region.entry(item.region.clone()).or_default().push(item);
    }

    for (region, items) in by_region {
        watchdog.touch();
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let dims: HashMap<&str, &TerminationPollItem> =
            items.iter().map(|i| (i.id.as_str(), i)).collect();

        let result = aws_call::aws_call(
            store,
            &region,
            "ec2",
            "describe_terminated_instances",
            cloud_call_timeout,
            CallMetadata::none(),
            async { provider.describe_terminated_instances(&region, &ids).await },
        )
        .await;

        let described = match result {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(%region, error = %e, "describe_terminated_instances failed, region skipped this tick");
                continue;
            }
        };

        for t in described {
            let Some(reason) = t.state_reason else {
                continue;
            };
            let Some(item) = dims.get(t.instance_id.as_str()) else {
                continue;
            };
            let stripped = strip_code_prefix(&reason.code, &reason.message);
            let classification = classify_termination(&reason.code);

            // counters per (worker-type x instance-type x region x
            // classification x code), carried as structured log fields since
            // this stack has no metrics crate of its own.
            tracing::info!(
                %region,
                instance_id = %t.instance_id,
                worker_type = %item.worker_type,
                instance_type = %item.instance_type,
                code = %reason.code,
                classification = ?classification,
                "termination classified"
            );

            if classification == TerminationClass::Exceptional {
                if let Err(e) = store
                    .record_recent_error(
                        &item.worker_type,
                        &region,
                        &reason.code,
                        &stripped,
                        &item.instance_type,
                    )
                    .await
                {
                    tracing::warn!(%region, instance_id = %t.instance_id, error = %e, "record_recent_error failed");
                }
            }

            if let Err(e) = store
                .update_termination_state(
                    &region,
                    &t.instance_id,
                    &reason.code,
                    &stripped,
                    chrono::Utc::now(),
                )
                .await
            {
                tracing::warn!(%region, instance_id = %t.instance_id, error = %e, "update_termination_state failed");
            }
        }
    }

    Ok(())
}

/// EC2 state-reason messages repeat the code as a `"<code>: "` prefix; this
/// strips it so the stored reason carries only the human part.
fn strip_code_prefix(code: &str, message: &str) -> String {
    let prefix = format!("{code}: ");
    message
        .strip_prefix(prefix.as_str())
        .unwrap_or(message)
        .to_string()
}

pub fn handler(
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    cloud_call_timeout: Duration,
) -> impl FnMut(Watchdog) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
{
    move |watchdog: Watchdog| {
        let store = store.clone();
        let provider = provider.clone();
        Box::pin(async move { poll_once(&store, provider.as_ref(), cloud_call_timeout, &watchdog).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_redundant_code_prefix() {
        assert_eq!(
            strip_code_prefix(
                "Client.UserInitiatedShutdown",
                "Client.UserInitiatedShutdown: User initiated"
            ),
            "User initiated"
        );
        assert_eq!(strip_code_prefix("Foo", "bare message"), "bare message");
    }
}
