use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_providers::CloudProvider;

use crate::aws_call::{self, CallMetadata};
use crate::iterator::Watchdog;
use crate::store::Store;

const BATCH_SIZE: usize = 100;

/// spec.md §4.7: an AMI is "gone" when the describe response either omits it
/// or reports a state other than `available`. Returns the gone ids for one
/// region; what to do about them (e.g. purge) is explicitly out of scope.
pub async fn find_gone_amis(
    store: &Store,
    provider: &dyn CloudProvider,
    region: &str,
    ami_ids: &[String],
    cloud_call_timeout: Duration,
) -> anyhow::Result<Vec<String>> {
    let mut gone = Vec::new();
    for batch in ami_ids.chunks(BATCH_SIZE) {
        let described = aws_call::aws_call(
            store,
            region,
            "ec2",
            "describe_images",
            cloud_call_timeout,
            CallMetadata::none(),
            async { provider.describe_images(region, &batch.to_vec()).await },
        )
        .await?;
        let available: HashMap<&str, &str> = described
            .iter()
            .map(|i| (i.image_id.as_str(), i.state.as_str()))
            .collect();
        for id in batch {
            match available.get(id.as_str()) {
                Some(state) if *state == "available" => {}
                _ => gone.push(id.clone()),
            }
        }
    }
    Ok(gone)
}

/// One iteration across every region with recorded AMI usage: seeds the
/// candidate id list from `listAmiUsage` when the caller didn't supply one.
pub async fn poll_once(
    store: &Store,
    provider: &dyn CloudProvider,
    cloud_call_timeout: Duration,
    watchdog: &Watchdog,
) -> anyhow::Result<()> {
    let usage = store.list_ami_usage().await?;
    let mut by_region: HashMap<String, Vec<String>> = HashMap::new();
    for row in usage {
        by_region.entry(row.region).or_default().push(row.id);
    }

    for (region, ids) in by_region {
        watchdog.touch();
        match find_gone_amis(store, provider, &region, &ids, cloud_call_timeout).await {
            Ok(gone) if !gone.is_empty() => {
                tracing::warn!(%region, count = gone.len(), ids = ?gone, "AMIs no longer available");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%region, error = %e, "describe_images failed, region skipped this tick");
            }
        }
    }

    Ok(())
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
    use fleet_providers::MockProvider;

    #[tokio::test]
    async fn flags_missing_and_unavailable_amis() {
        let pool = Store::new_test_pool().await;
        let store = Store::new(pool);
        let provider = MockProvider::new();
        provider.seed_image("us-east-1", "ami-good", "available");
        provider.seed_image("us-east-1", "ami-pending", "pending");

        let gone = find_gone_amis(
            &store,
            &provider,
            "us-east-1",
            &["ami-good".to_string(), "ami-pending".to_string(), "ami-missing".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(gone, vec!["ami-pending".to_string(), "ami-missing".to_string()]);
    }
}
