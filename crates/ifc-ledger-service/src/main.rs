use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ifc_ledger_api::{
    ApproveIdentifiersRequest, EditResult, IngestRequest, IngestResult, LedgerApi, LedgerConfig,
    MigrateResult, SetApprovalRequest, SetStatusRequest, API_CONTRACT_VERSION,
};
use ifc_ledger_core::{
    ApprovalImportSummary, EntryStatus, LedgerFilter, LedgerRow, LedgerStats, ReconcileRunSummary,
};
use ifc_ledger_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: LedgerApi,
    /// Serialises migrations and mutating requests. Reads never migrate, so
    /// they skip it.
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LedgerQuery {
    source_name: Option<String>,
    status: Option<EntryStatus>,
    container: Option<String>,
    contains: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RunsQuery {
    source_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct RowsResponse {
    count: usize,
    rows: Vec<LedgerRow>,
}

#[derive(Debug, Parser)]
#[command(name = "ifc-ledger-service")]
#[command(about = "Local HTTP service for the IFC element ledger")]
struct Args {
    #[arg(long, env = "IFCL_DB")]
    db: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, env = "IFCL_CONFIG")]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn new(api: LedgerApi) -> Self {
        Self { api, write_lock: Arc::new(Mutex::new(())) }
    }

    fn error(err: &anyhow::Error) -> ServiceError {
        tracing::warn!(error = %format!("{err:#}"), "request failed");
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
    }
}

impl From<LedgerQuery> for LedgerFilter {
    fn from(query: LedgerQuery) -> Self {
        LedgerFilter {
            source_name: query.source_name,
            status: query.status,
            container: query.container,
            identifier_contains: query.contains,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/ingest", post(ingest))
        .route("/v1/ledger", get(ledger_list))
        .route("/v1/ledger/stats", get(ledger_stats))
        .route("/v1/ledger/runs", get(ledger_runs))
        .route("/v1/ledger/approval", post(ledger_set_approval))
        .route("/v1/ledger/approvals", post(ledger_approve_identifiers))
        .route("/v1/ledger/status", post(ledger_set_status))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => LedgerConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => LedgerConfig::default(),
    };
    let db = args.db.unwrap_or_else(|| config.database.clone());
    let state = ServiceState::new(LedgerApi::with_config(db, config));

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %state.api.db_path().display(),
        "ledger service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let _guard = state.write_lock.lock().await;
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn ingest(
    State(state): State<ServiceState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<ServiceEnvelope<IngestResult>>, ServiceError> {
    let _guard = state.write_lock.lock().await;
    let result = state.api.ingest(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn ledger_list(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<ServiceEnvelope<RowsResponse>>, ServiceError> {
    let rows =
        state.api.list_rows(&LedgerFilter::from(query)).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(RowsResponse { count: rows.len(), rows })))
}

async fn ledger_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<LedgerStats>>, ServiceError> {
    let stats = state.api.stats().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(stats)))
}

async fn ledger_runs(
    State(state): State<ServiceState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<ServiceEnvelope<Vec<ReconcileRunSummary>>>, ServiceError> {
    let runs = state
        .api
        .list_runs(query.source_name.as_deref())
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(runs)))
}

async fn ledger_set_approval(
    State(state): State<ServiceState>,
    Json(request): Json<SetApprovalRequest>,
) -> Result<Json<ServiceEnvelope<EditResult>>, ServiceError> {
    let _guard = state.write_lock.lock().await;
    let result = state.api.set_approval(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn ledger_approve_identifiers(
    State(state): State<ServiceState>,
    Json(request): Json<ApproveIdentifiersRequest>,
) -> Result<Json<ServiceEnvelope<ApprovalImportSummary>>, ServiceError> {
    let _guard = state.write_lock.lock().await;
    let summary = state.api.approve_identifiers(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(summary)))
}

async fn ledger_set_status(
    State(state): State<ServiceState>,
    Json(request): Json<SetStatusRequest>,
) -> Result<Json<ServiceEnvelope<EditResult>>, ServiceError> {
    let _guard = state.write_lock.lock().await;
    let result = state.api.set_status(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const MODEL: &str = "ISO-10303-21;
HEADER;
FILE_DESCRIPTION((''),'2;1');
FILE_NAME('site.ifc','2024-05-06T12:00:00',(''),(''),'','','');
FILE_SCHEMA(('IFC4'));
ENDSEC;
DATA;
#1=IFCOWNERHISTORY($,$,$,.ADDED.,$,$,$,0);
#10=IFCBUILDINGSTOREY('storey0000000000000001',#1,'Basement',$,$,$,$,$,.ELEMENT.,-3.);
#20=IFCBUILDINGELEMENTPROXY('G1',#1,'Pump',$,$,$,$,$,$);
#21=IFCBUILDINGELEMENTPROXY('G2',#1,'Tank',$,$,$,$,$,$);
#30=IFCRELCONTAINEDINSPATIALSTRUCTURE('relcon0000000000000001',#1,$,$,(#20,#21),#10);
ENDSEC;
END-ISO-10303-21;
";

    struct Harness {
        dir: tempfile::TempDir,
        router: Router,
    }

    fn harness() -> Harness {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let state = ServiceState::new(LedgerApi::new(dir.path().join("ledger.sqlite3")));
        Harness { dir, router: app(state) }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let harness = harness();
        let response = send(&harness.router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_endpoint_lists_ledger_routes() {
        let harness = harness();
        let response = send(&harness.router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/ingest"));
        assert!(body.contains("/v1/ledger/approvals"));
    }

    #[tokio::test]
    async fn service_ingest_edit_and_list_flow() {
        let harness = harness();
        let model = harness.dir.path().join("site.ifc");
        if let Err(err) = std::fs::write(&model, MODEL) {
            panic!("failed to write model: {err}");
        }

        let ingest = send(
            &harness.router,
            "POST",
            "/v1/ingest",
            Some(serde_json::json!({ "file": model })),
        )
        .await;
        assert_eq!(ingest.status(), StatusCode::OK);
        let ingest = response_json(ingest).await;
        assert_eq!(ingest["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(ingest["data"]["report"]["inserted"], serde_json::json!(["G1", "G2"]));
        assert_eq!(ingest["data"]["report"]["observed_on"], "240506");

        let approvals = send(
            &harness.router,
            "POST",
            "/v1/ledger/approvals",
            Some(serde_json::json!({ "role": "architect", "identifiers": ["G1", "G7"] })),
        )
        .await;
        assert_eq!(approvals.status(), StatusCode::OK);
        let approvals = response_json(approvals).await;
        assert_eq!(approvals["data"]["updated"], 1);
        assert_eq!(approvals["data"]["unknown"], serde_json::json!(["G7"]));

        let status = send(
            &harness.router,
            "POST",
            "/v1/ledger/status",
            Some(serde_json::json!({ "identifier": "G2", "status": "deleted", "date": "240601" })),
        )
        .await;
        assert_eq!(status.status(), StatusCode::OK);

        let listed = send(&harness.router, "GET", "/v1/ledger?status=active", None).await;
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = response_json(listed).await;
        assert_eq!(listed["data"]["count"], 1);
        assert_eq!(listed["data"]["rows"][0]["identifier"], "G1");
        assert_eq!(listed["data"]["rows"][0]["architect_approval"], true);
        assert_eq!(listed["data"]["rows"][0]["container"], "Basement");

        let stats =
            response_json(send(&harness.router, "GET", "/v1/ledger/stats", None).await).await;
        assert_eq!(stats["data"]["total"], 2);
        assert_eq!(stats["data"]["deleted"], 1);

        let runs = response_json(
            send(&harness.router, "GET", "/v1/ledger/runs?source_name=site.ifc", None).await,
        )
        .await;
        assert_eq!(runs["data"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn service_errors_use_bad_request_envelope() {
        let harness = harness();
        let response = send(
            &harness.router,
            "POST",
            "/v1/ledger/approval",
            Some(serde_json::json!({
                "identifier": "missing",
                "role": "structural",
                "value": true
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value["error"]
            .as_str()
            .is_some_and(|error| error.contains("ledger row not found")));

        let missing_model = send(
            &harness.router,
            "POST",
            "/v1/ingest",
            Some(serde_json::json!({ "file": harness.dir.path().join("absent.ifc") })),
        )
        .await;
        assert_eq!(missing_model.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn service_reads_reject_unmigrated_ledger() {
        let harness = harness();
        let listed = send(&harness.router, "GET", "/v1/ledger", None).await;
        assert_eq!(listed.status(), StatusCode::BAD_REQUEST);
        let listed = response_json(listed).await;
        assert!(listed["error"].as_str().is_some_and(|error| error.contains("db migrate")));

        let stats = send(&harness.router, "GET", "/v1/ledger/stats", None).await;
        assert_eq!(stats.status(), StatusCode::BAD_REQUEST);

        let status =
            response_json(send(&harness.router, "POST", "/v1/db/schema-version", None).await).await;
        assert_eq!(status["data"]["current_version"], 0);

        let migrated = send(
            &harness.router,
            "POST",
            "/v1/db/migrate",
            Some(serde_json::json!({ "dry_run": false })),
        )
        .await;
        assert_eq!(migrated.status(), StatusCode::OK);
        let listed = response_json(send(&harness.router, "GET", "/v1/ledger", None).await).await;
        assert_eq!(listed["data"]["count"], 0);
    }

    #[tokio::test]
    async fn service_migrate_dry_run_does_not_apply() {
        let harness = harness();
        let dry = response_json(
            send(
                &harness.router,
                "POST",
                "/v1/db/migrate",
                Some(serde_json::json!({ "dry_run": true })),
            )
            .await,
        )
        .await;
        assert_eq!(dry["data"]["would_apply_versions"], serde_json::json!([1, 2, 3]));

        let status =
            response_json(send(&harness.router, "POST", "/v1/db/schema-version", None).await).await;
        assert_eq!(status["data"]["current_version"], 0);
    }
}
