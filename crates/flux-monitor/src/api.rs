use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use flux_alert::{AlertFilter, RuleSpec};
use flux_core::FluxError;
use flux_ingest::IngestRequest;
use flux_shutdown::ShutdownPhase;
use flux_timeseries::{parse_duration, AggregatedSeries};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

/// 默认范围查询步长
const DEFAULT_STEP: &str = "1m";

/// 默认返回的通知条数
const DEFAULT_NOTIFICATION_LIMIT: usize = 100;

/// API 错误，在边界统一映射为状态码与 JSON
pub struct ApiError(FluxError);

impl From<FluxError> for ApiError {
    fn from(e: FluxError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let message = match &self.0 {
            FluxError::Validation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let mut body = json!({
            "error": self.0.kind(),
            "message": message,
        });
        if let Some(field) = self.0.field() {
            body["field"] = Value::String(field.to_string());
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", post(ingest_metrics))
        .route("/query", get(query))
        .route("/rules", post(create_rule).get(list_rules))
        .route("/rules/:id", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/alerts", get(list_alerts))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/delivered", post(mark_delivered))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    flux_metrics::record_http_request();
    next.run(req).await
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let phase = *state.phase.borrow();
    let status = match phase {
        ShutdownPhase::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };

    let status_text = match phase {
        ShutdownPhase::Running => "ok",
        other => other.as_str(),
    };
    let body = json!({
        "status": status_text,
        "firing_alerts": state.alerts.active_alerts().firing_count().await,
        "buffered_samples": state.pipeline.buffered().await,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    });
    (status, Json(body))
}

async fn ingest_metrics(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> ApiResult<impl IntoResponse> {
    let request: IngestRequest = serde_json::from_value(body).map_err(|_| {
        FluxError::invalid_field("metrics", "expected an array of metrics or an object with a metrics array")
    })?;

    let summary = state.pipeline.submit_entries(request.into_entries()).await;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub query: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub step: Option<String>,
}

/// 解析 RFC3339 或 unix 秒
fn parse_time(field: &str, input: &str) -> Result<DateTime<Utc>, FluxError> {
    if let Some(secs) = input.parse::<f64>().ok().filter(|s| s.is_finite()) {
        let millis = (secs * 1000.0).round() as i64;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| FluxError::invalid_field(field, format!("timestamp out of range: {}", input)));
    }
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| FluxError::invalid_field(field, format!("expected RFC3339 or unix seconds, got {}", input)))
}

fn unix_secs(t: &DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

fn series_json(series: &AggregatedSeries) -> Value {
    let points: Vec<Value> = series
        .points
        .iter()
        .map(|p| json!([unix_secs(&p.timestamp), p.value]))
        .collect();
    json!({ "labels": series.labels, "points": points })
}

/// 未给出 start 时执行即时查询，每个序列返回一个点
async fn query(State(state): State<Arc<AppState>>, Query(params): Query<QueryParams>) -> ApiResult<Json<Value>> {
    let end = match params.end.as_deref() {
        Some(end) => parse_time("end", end)?,
        None => Utc::now(),
    };

    let series: Vec<Value> = match params.start.as_deref() {
        Some(start) => {
            let start = parse_time("start", start)?;
            let step = parse_duration(params.step.as_deref().unwrap_or(DEFAULT_STEP))
                .map_err(|e| FluxError::invalid_field("step", e.to_string()))?;
            state
                .engine
                .range(&params.query, start, end, step)
                .await?
                .iter()
                .map(series_json)
                .collect()
        }
        None => state
            .engine
            .instant(&params.query, end)
            .await?
            .into_iter()
            .map(|v| json!({ "labels": v.labels, "points": [[unix_secs(&v.timestamp), v.value]] }))
            .collect(),
    };

    Ok(Json(json!({ "series": series })))
}

async fn create_rule(State(state): State<Arc<AppState>>, Json(spec): Json<RuleSpec>) -> ApiResult<impl IntoResponse> {
    let rule = state.alerts.catalog().create(spec).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_rules(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let rules = state.alerts.catalog().list().await?;
    Ok(Json(json!({ "rules": rules })))
}

async fn get_rule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.alerts.catalog().get(&id).await?))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.alerts.update_rule(&id, spec, Utc::now()).await?))
}

async fn delete_rule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.alerts.delete_rule(&id, Utc::now()).await?))
}

async fn list_alerts(State(state): State<Arc<AppState>>, Query(filter): Query<AlertFilter>) -> ApiResult<Json<Value>> {
    let alerts = state.alerts.alerts(&filter).await?;
    Ok(Json(json!({ "alerts": alerts })))
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub alert_id: Option<String>,
    pub limit: Option<usize>,
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NotificationParams>,
) -> ApiResult<Json<Value>> {
    let limit = params.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT);
    let notifications = match params.alert_id.as_deref() {
        Some(alert_id) => {
            let mut records = state.notifications.for_alert(alert_id).await?;
            records.truncate(limit);
            records
        }
        None => state.notifications.recent(limit).await?,
    };
    Ok(Json(json!({ "notifications": notifications })))
}

async fn mark_delivered(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.notifications.mark_delivered(&id).await?))
}
