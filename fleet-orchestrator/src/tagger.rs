use fleet_providers::CloudProvider;

/// spec.md §4.9: given a batch of ids that share a worker type, issue one
/// `createTags` with the fixed three-tag set. Stateless and idempotent from
/// the cloud's perspective — safe to call again on the next housekeeper tick
/// if this one's `createTags` fails.
pub async fn tag_resources(
    provider: &dyn CloudProvider,
    region: &str,
    ids: &[String],
    worker_type: &str,
    manager_id: &str,
) -> anyhow::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let tags = vec![
        ("Name".to_string(), worker_type.to_string()),
        ("Owner".to_string(), manager_id.to_string()),
        ("WorkerType".to_string(), format!("{manager_id}/{worker_type}")),
    ];
    provider.create_tags(region, ids, &tags).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_providers::MockProvider;

    #[tokio::test]
    async fn skips_empty_batches() {
        let provider = MockProvider::new();
        tag_resources(&provider, "us-east-1", &[], "wt", "mgr")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tags_carry_fixed_three_key_set() {
        let provider = MockProvider::new();
        let ids = provider
            .run_instances(
                "us-east-1",
                &fleet_providers::model::RunInstancesRequest {
                    availability_zone: "us-east-1a".into(),
                    instance_type: "m5.large".into(),
                    image_id: "ami-1".into(),
                    key_name: "fleet:wt:abc".into(),
                    min_count: 1,
                    max_count: 1,
                    spot: false,
                    spot_max_price: None,
                    tags: Vec::new(),
                },
            )
            .await
            .unwrap();

        tag_resources(&provider, "us-east-1", &ids, "wt", "mgr").await.unwrap();

        let described = provider.describe_instances("us-east-1", &ids).await.unwrap();
        let tags = &described[0].tags;
        assert!(tags.contains(&("Name".to_string(), "wt".to_string())));
        assert!(tags.contains(&("Owner".to_string(), "mgr".to_string())));
        assert!(tags.contains(&("WorkerType".to_string(), "mgr/wt".to_string())));
    }
}
