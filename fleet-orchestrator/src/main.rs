use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use fleet_common::config::FleetConfig;
use fleet_common::error::FleetError;
use fleet_common::filter::Filter;
use fleet_common::types::{Instance, InstanceState, SpotRequest, SpotRequestState, SpotRequestStatus};
use fleet_providers::model::RunInstancesRequest;
use fleet_providers::CloudProvider;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

mod aws_call;
mod event_ingestor;
mod iterator;
mod reconciliation;
mod store;
mod tagger;

use iterator::{IteratorConfig, PeriodicLoop};
use store::Store;

struct AppState {
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    config: FleetConfig,
}

#[cfg(feature = "provider-mock")]
fn build_provider() -> Arc<dyn CloudProvider> {
    Arc::new(fleet_providers::MockProvider::new())
}

#[cfg(all(feature = "provider-live", not(feature = "provider-mock")))]
fn build_provider() -> Arc<dyn CloudProvider> {
    Arc::new(fleet_providers::Ec2Provider::new())
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = FleetConfig::from_env().expect("invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let redis_client = redis::Client::open(config.redis_url.clone()).expect("invalid REDIS_URL");

    let store = Arc::new(Store::new(pool));
    let provider = build_provider();

    spawn_reconciliation_loops(store.clone(), provider.clone(), &config);
    spawn_event_ingestors(store.clone(), provider.clone(), redis_client, &config);

    let state = Arc::new(AppState {
        store,
        provider,
        config: config.clone(),
    });

    let app = Router::new()
        .route("/worker-types", get(list_worker_types))
        .route("/worker-types/:worker_type/stats", get(worker_type_stats))
        .route("/worker-types/:worker_type/state", get(worker_type_state))
        .route("/worker-types/:worker_type/health", get(worker_type_health))
        .route("/worker-types/:worker_type/errors", get(worker_type_errors))
        .route("/worker-types/:worker_type", delete(terminate_worker_type))
        .route("/instances", post(run_instance))
        .route("/instances/:region/:id", delete(terminate_instance))
        .route("/key-pairs/:region/:key_name", post(ensure_key_pair))
        .route("/key-pairs/:region/:key_name", delete(remove_key_pair))
        .route("/prices/:region", get(get_prices))
        .route("/prices/:region/:instance_type", get(get_specific_prices))
        .route("/health", get(get_health))
        .route("/errors", get(get_recent_errors))
        .route("/internal/pool-pressure", get(pool_pressure))
        .with_state(state);

    let addr: SocketAddr = config
        .http_bind_addr
        .parse()
        .expect("HTTP_BIND_ADDR must be a valid socket address");
    tracing::info!(%addr, "fleet-orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app.into_make_service()).await.unwrap();
}

fn spawn_reconciliation_loops(store: Arc<Store>, provider: Arc<dyn CloudProvider>, config: &FleetConfig) {
    let base = IteratorConfig {
        interval: Duration::from_secs(config.spot_poll_interval_secs),
        max_iteration_time: Duration::from_secs(config.max_iteration_time_secs),
        watchdog_timeout: Duration::from_secs(config.max_iteration_time_secs),
        max_consecutive_failures: config.max_consecutive_failures,
    };

    let on_fatal = |f: iterator::FatalFailure| {
        tracing::error!(loop_name = %f.loop_name, failures = f.consecutive_failures, "reconciliation loop declared fatal");
    };

    let cloud_call_timeout = Duration::from_secs(config.cloud_call_timeout_secs);

    PeriodicLoop::new("spot-request-poller", base.clone()).start(
        reconciliation::spot::handler(
            store.clone(),
            provider.clone(),
            config.regions.clone(),
            cloud_call_timeout,
        ),
        on_fatal,
    );

    let termination_config = IteratorConfig {
        interval: Duration::from_secs(config.termination_poll_interval_secs),
        ..base.clone()
    };
    PeriodicLoop::new("termination-poller", termination_config).start(
        reconciliation::termination::handler(store.clone(), provider.clone(), cloud_call_timeout),
        on_fatal,
    );

    let ami_config = IteratorConfig {
        interval: Duration::from_secs(config.ami_poll_interval_secs),
        ..base.clone()
    };
    PeriodicLoop::new("ami-existence-poller", ami_config).start(
        reconciliation::ami::handler(store.clone(), provider.clone(), cloud_call_timeout),
        on_fatal,
    );

    let housekeeper_config = IteratorConfig {
        interval: Duration::from_secs(config.housekeeper_interval_secs),
        ..base
    };
    PeriodicLoop::new("housekeeper", housekeeper_config).start(
        reconciliation::housekeeper::handler(
            store,
            provider,
            config.regions.clone(),
            config.key_prefix.clone(),
            config.manager_id.clone(),
            config.max_instance_life_hours,
            cloud_call_timeout,
        ),
        on_fatal,
    );
}

fn spawn_event_ingestors(
    store: Arc<Store>,
    provider: Arc<dyn CloudProvider>,
    redis_client: redis::Client,
    config: &FleetConfig,
) {
    for region in &config.regions {
        let store = store.clone();
        let provider = provider.clone();
        let redis_client = redis_client.clone();
        let region = region.clone();
        tokio::spawn(async move {
            if let Err(e) = event_ingestor::run(redis_client, store, provider, region.clone()).await {
                tracing::error!(%region, error = %e, "event ingestor exited");
            }
        });
    }
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

fn error_status(err: &FleetError) -> StatusCode {
    match err {
        FleetError::Validation(_) | FleetError::Conflict(_) => StatusCode::BAD_REQUEST,
        FleetError::Dedup => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn list_worker_types(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_worker_types().await {
        Ok(types) => Json(json!({ "workerTypes": types })).into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn worker_type_stats(
    State(state): State<Arc<AppState>>,
    Path(worker_type): Path<String>,
) -> impl IntoResponse {
    match state.store.instance_counts(&worker_type).await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn worker_type_state(
    State(state): State<Arc<AppState>>,
    Path(worker_type): Path<String>,
) -> impl IntoResponse {
    let filter = Filter::new().eq("worker_type", worker_type);
    let instances = state.store.list_instances(&filter).await;
    let spot_requests = state.store.list_spot_requests(&filter).await;
    match (instances, spot_requests) {
        (Ok(instances), Ok(spot_requests)) => {
            Json(json!({ "instances": instances, "spotRequests": spot_requests })).into_response()
        }
        (Err(e), _) | (_, Err(e)) => {
            (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn worker_type_health(
    State(state): State<Arc<AppState>>,
    Path(worker_type): Path<String>,
) -> impl IntoResponse {
    let filter = Filter::new().eq("worker_type", worker_type);
    match state.store.get_health(&filter).await {
        Ok(health) => Json(health).into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn worker_type_errors(
    State(state): State<Arc<AppState>>,
    Path(worker_type): Path<String>,
) -> impl IntoResponse {
    let filter = Filter::new().eq("worker_type", worker_type);
    match state.store.get_recent_errors(&filter).await {
        Ok(errors) => Json(errors).into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn terminate_worker_type(
    State(state): State<Arc<AppState>>,
    Path(worker_type): Path<String>,
) -> impl IntoResponse {
    let filter = Filter::new().eq("worker_type", worker_type.clone());
    let instances = match state.store.list_instances(&filter).await {
        Ok(i) => i,
        Err(e) => return (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    };

    let mut by_region: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for i in instances {
        by_region.entry(i.region).or_default().push(i.id);
    }

    for (region, ids) in by_region {
        if let Err(e) = state.provider.terminate_instances(&region, &ids).await {
            tracing::warn!(%region, %worker_type, error = %e, "terminate_instances failed during worker-type termination");
            continue;
        }
        for id in ids {
            let _ = state.store.remove_instance(&region, &id).await;
        }
    }

    StatusCode::ACCEPTED.into_response()
}

#[derive(Deserialize)]
struct RunInstanceRequest {
    region: String,
    worker_type: String,
    availability_zone: String,
    instance_type: String,
    image_id: String,
    key_name: String,
    spot: bool,
    spot_max_price: Option<String>,
}

async fn run_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunInstanceRequest>,
) -> impl IntoResponse {
    let call_timeout = Duration::from_secs(state.config.cloud_call_timeout_secs);
    let metadata = aws_call::CallMetadata {
        worker_type: Some(req.worker_type.clone()),
        availability_zone: Some(req.availability_zone.clone()),
        instance_type: Some(req.instance_type.clone()),
        image_id: Some(req.image_id.clone()),
    };

    let provider_req = RunInstancesRequest {
        availability_zone: req.availability_zone.clone(),
        instance_type: req.instance_type.clone(),
        image_id: req.image_id.clone(),
        key_name: req.key_name.clone(),
        min_count: 1,
        max_count: 1,
        spot: req.spot,
        spot_max_price: req.spot_max_price,
        tags: vec![("Name".to_string(), req.worker_type.clone())],
    };

    let provider = state.provider.clone();
    let region = req.region.clone();
    let result = aws_call::aws_call(
        &state.store,
        &region,
        "ec2",
        "run_instances",
        call_timeout,
        metadata,
        async move { provider.run_instances(&region, &provider_req).await },
    )
    .await;

    let ids = match result {
        Ok(ids) => ids,
        Err(e) => return (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    };

    if let Err(e) = state.store.report_ami_usage(&req.region, &req.image_id).await {
        tracing::warn!(region = %req.region, image_id = %req.image_id, error = %e, "failed to record AMI usage");
    }

    if req.spot {
        for id in &ids {
            let row = SpotRequest {
                region: req.region.clone(),
                id: id.clone(),
                worker_type: req.worker_type.clone(),
                availability_zone: req.availability_zone.clone(),
                instance_type: req.instance_type.clone(),
                state: SpotRequestState::Open,
                status: SpotRequestStatus::new(SpotRequestStatus::PENDING_EVALUATION),
                image_id: req.image_id.clone(),
                created: chrono::Utc::now(),
            };
            if let Err(e) = state.store.insert_spot_request(&row).await {
                tracing::warn!(error = %e, "failed to record spot request after run_instances");
            }
        }
    } else {
        for id in &ids {
            let row = Instance {
                region: req.region.clone(),
                id: id.clone(),
                worker_type: req.worker_type.clone(),
                availability_zone: req.availability_zone.clone(),
                instance_type: req.instance_type.clone(),
                state: InstanceState::Pending,
                image_id: req.image_id.clone(),
                launched: chrono::Utc::now(),
                last_event: chrono::Utc::now(),
                source_request_id: None,
            };
            if let Err(e) = state.store.insert_instance(&row).await {
                tracing::warn!(error = %e, "failed to record instance after run_instances");
            }
        }
    }

    Json(json!({ "ids": ids })).into_response()
}

async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
) -> impl IntoResponse {
    if let Err(e) = state.provider.terminate_instances(&region, &[id.clone()]).await {
        return internal_error(e).into_response();
    }
    match state.store.remove_instance(&region, &id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn ensure_key_pair(
    State(state): State<Arc<AppState>>,
    Path((region, key_name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.provider.describe_key_pairs(&region, &key_name).await {
        Ok(existing) if !existing.is_empty() => Json(json!({ "created": false })).into_response(),
        Ok(_) => {
            let dummy_public_key = format!("ssh-rsa AAAA... {key_name}");
            match state
                .provider
                .import_key_pair(&region, &key_name, dummy_public_key.as_bytes())
                .await
            {
                Ok(()) => Json(json!({ "created": true })).into_response(),
                Err(e) => internal_error(e).into_response(),
            }
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn remove_key_pair(
    State(state): State<Arc<AppState>>,
    Path((region, key_name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.provider.delete_key_pair(&region, &key_name).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct PricesQuery {
    instance_types: Option<String>,
    availability_zone: Option<String>,
}

async fn get_prices(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Query(q): Query<PricesQuery>,
) -> impl IntoResponse {
    let types: Vec<String> = q
        .instance_types
        .map(|s| s.split(',').map(|t| t.trim().to_string()).collect())
        .unwrap_or_default();
    match state
        .provider
        .describe_spot_price_history(&region, &types, q.availability_zone.as_deref())
        .await
    {
        Ok(prices) => Json(prices).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_specific_prices(
    State(state): State<Arc<AppState>>,
    Path((region, instance_type)): Path<(String, String)>,
    Query(q): Query<PricesQuery>,
) -> impl IntoResponse {
    match state
        .provider
        .describe_spot_price_history(&region, &[instance_type], q.availability_zone.as_deref())
        .await
    {
        Ok(prices) => Json(prices).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct FilterQuery {
    region: Option<String>,
    worker_type: Option<String>,
}

fn filter_from_query(q: &FilterQuery) -> Filter {
    let mut filter = Filter::new();
    if let Some(region) = &q.region {
        filter = filter.eq("region", region.clone());
    }
    if let Some(worker_type) = &q.worker_type {
        filter = filter.eq("worker_type", worker_type.clone());
    }
    filter
}

async fn get_health(State(state): State<Arc<AppState>>, Query(q): Query<FilterQuery>) -> impl IntoResponse {
    match state.store.get_health(&filter_from_query(&q)).await {
        Ok(health) => Json(health).into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn get_recent_errors(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FilterQuery>,
) -> impl IntoResponse {
    match state.store.get_recent_errors(&filter_from_query(&q)).await {
        Ok(errors) => Json(errors).into_response(),
        Err(e) => (error_status(&e), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn pool_pressure(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.store.pool_pressure();
    Json(json!({ "size": snapshot.size, "idle": snapshot.idle })).into_response()
}
