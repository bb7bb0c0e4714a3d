//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chronodb_core::engine::DEFAULT_TIMESTAMP_COLUMN;
use chronodb_core::{ChronoError, Engine, Row, TableInfo, TxnId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state
pub type AppState = Arc<Engine>;

/// Create the API router
pub fn create_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Ingestion
        .route("/write/:table", post(write))

        // Table status
        .route("/tables", get(list_tables))
        .route("/tables/:name", get(table_info))
        .route("/tables/:name/resume", post(resume_table))
        .route("/tables/:name/rows", get(table_rows))

        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct WriteParams {
    /// Comma separated fields to store as symbols
    symbols: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RowsParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub rows: u64,
    /// Txn the batch was sequenced as
    pub txn: Option<TxnId>,
}

#[derive(Debug, Serialize)]
pub struct RowsResponse {
    pub version: TxnId,
    pub row_count: u64,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error mapped to a status code
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] ChronoError),

    #[error("{0}")]
    BadRequest(String),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Engine(ChronoError::TableNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Engine(ChronoError::TableSuspended { .. }) => StatusCode::CONFLICT,
            ApiError::Engine(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: chronodb_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

/// Write a JSON array of rows as one transaction
async fn write(
    State(engine): State<AppState>,
    Path(table): Path<String>,
    Query(params): Query<WriteParams>,
    Json(body): Json<Vec<serde_json::Map<String, serde_json::Value>>>,
) -> Result<Json<WriteResponse>, ApiError> {
    let symbols: HashSet<String> = params
        .symbols
        .as_deref()
        .map(|s| s.split(',').map(|f| f.trim().to_string()).collect())
        .unwrap_or_default();
    // auto-created tables get the default designated timestamp
    let ts_column = match engine.table(&table) {
        Ok(handle) => handle.sequencer().structure().timestamp_column().to_string(),
        Err(ChronoError::TableNotFound(_)) => DEFAULT_TIMESTAMP_COLUMN.to_string(),
        Err(e) => return Err(e.into()),
    };
    let rows = body
        .into_iter()
        .map(|object| parse_row(object, &ts_column, &symbols))
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Err(ApiError::BadRequest("no rows to write".into()));
    }

    let response = tokio::task::spawn_blocking(move || -> Result<WriteResponse, ChronoError> {
        let mut writer = engine.writer_or_create(&table, &rows[0])?;
        for row in rows {
            if let Err(e) = writer.append(row) {
                writer.rollback();
                return Err(e);
            }
        }
        let count = writer.pending_rows();
        let txn = writer.commit()?;
        writer.close()?;
        debug!("Wrote {} rows to {} as txn {:?}", count, table, txn);
        Ok(WriteResponse { rows: count, txn })
    })
    .await??;

    Ok(Json(response))
}

async fn list_tables(State(engine): State<AppState>) -> Json<Vec<TableInfo>> {
    Json(engine.tables_info())
}

async fn table_info(
    State(engine): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TableInfo>, ApiError> {
    engine
        .tables_info()
        .into_iter()
        .find(|info| info.name == name)
        .map(Json)
        .ok_or_else(|| ApiError::Engine(ChronoError::TableNotFound(name)))
}

async fn resume_table(
    State(engine): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.resume_table(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Rows visible at the latest commit version
async fn table_rows(
    State(engine): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<RowsParams>,
) -> Result<Json<RowsResponse>, ApiError> {
    let response = tokio::task::spawn_blocking(move || -> Result<RowsResponse, ChronoError> {
        let snapshot = engine.snapshot(&name)?;
        let ts_column = snapshot.structure().timestamp_column().to_string();
        let limit = params.limit.unwrap_or(usize::MAX);
        let rows = snapshot
            .rows()?
            .into_iter()
            .take(limit)
            .map(|row| {
                let mut object = serde_json::Map::new();
                object.insert(ts_column.clone(), row.timestamp.into());
                for (column, value) in row.fields {
                    object.insert(column, to_json(value));
                }
                object
            })
            .collect();
        Ok(RowsResponse {
            version: snapshot.version(),
            row_count: snapshot.row_count(),
            rows,
        })
    })
    .await??;
    Ok(Json(response))
}

// ============================================================================
// JSON rows
// ============================================================================

fn parse_row(
    object: serde_json::Map<String, serde_json::Value>,
    ts_column: &str,
    symbols: &HashSet<String>,
) -> Result<Row, ApiError> {
    let mut timestamp = None;
    let mut fields = Vec::with_capacity(object.len());
    for (key, value) in object {
        if key.eq_ignore_ascii_case(ts_column) {
            timestamp = Some(value.as_i64().ok_or_else(|| {
                ApiError::BadRequest(format!("{} must be integer microseconds", key))
            })?);
            continue;
        }
        let value = from_json(&key, value)?;
        let value = match value {
            Value::Str(s) if symbols.contains(&key) => Value::Symbol(s),
            other => other,
        };
        fields.push((key, value));
    }

    let timestamp = timestamp
        .ok_or_else(|| ApiError::BadRequest(format!("row has no {}", ts_column)))?;
    Ok(fields
        .into_iter()
        .fold(Row::new(timestamp), |row, (k, v)| row.with(k, v)))
}

fn from_json(key: &str, value: serde_json::Value) -> Result<Value, ApiError> {
    use serde_json::Value as Json;
    Ok(match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Long(i),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Str(s),
        Json::Array(_) | Json::Object(_) => {
            return Err(ApiError::BadRequest(format!(
                "field {} must be a scalar value",
                key
            )))
        }
    })
}

fn to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => b.into(),
        Value::Byte(v) => v.into(),
        Value::Short(v) => v.into(),
        Value::Int(v) => v.into(),
        Value::Long(v) | Value::Timestamp(v) => v.into(),
        Value::Double(v) => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) | Value::Symbol(s) => s.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chronodb_core::schema::{ColumnDef, TableStructure};
    use chronodb_core::{ColumnType, EngineConfig, PartitionBy};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn engine(dir: &TempDir) -> Arc<Engine> {
        Engine::open(EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_parse_row() {
        let object = serde_json::json!({"timestamp": 10, "host": "a", "cpu": 0.5, "n": 3, "ok": true})
            .as_object()
            .cloned()
            .unwrap();
        let symbols: HashSet<String> = ["host".to_string()].into_iter().collect();
        let row = parse_row(object, DEFAULT_TIMESTAMP_COLUMN, &symbols).unwrap();

        assert_eq!(row.timestamp, 10);
        assert_eq!(row.fields["host"], Value::Symbol("a".into()));
        assert_eq!(row.fields["cpu"], Value::Double(0.5));
        assert_eq!(row.fields["n"], Value::Long(3));
        assert_eq!(row.fields["ok"], Value::Boolean(true));

        let missing = serde_json::json!({"cpu": 1.0}).as_object().cloned().unwrap();
        assert!(matches!(
            parse_row(missing, DEFAULT_TIMESTAMP_COLUMN, &symbols),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_write_apply_and_read() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let app = create_router(engine.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/write/cpu?symbols=host",
                serde_json::json!([
                    {"timestamp": 2_000, "host": "b", "usage": 2.0},
                    {"timestamp": 1_000, "host": "a", "usage": 1.0},
                ]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let written = body_json(response).await;
        assert_eq!(written["rows"], 2);
        assert_eq!(written["txn"], 1);

        let table = engine.table("cpu").unwrap();
        engine.apply_job().apply_table(&table);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/tables/cpu/rows")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows = body_json(response).await;
        assert_eq!(rows["version"], 1);
        assert_eq!(rows["rows"][0]["timestamp"], 1_000);
        assert_eq!(rows["rows"][0]["host"], "a");
        assert_eq!(rows["rows"][1]["usage"], 2.0);
    }

    #[tokio::test]
    async fn test_write_uses_designated_timestamp_name() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let structure = TableStructure::new(
            "quotes",
            vec![
                ColumnDef::new("bid", ColumnType::Double),
                ColumnDef::new("at", ColumnType::Timestamp),
            ],
            "at",
            PartitionBy::Day,
        )
        .unwrap();
        let table = engine.create_table(structure).unwrap();
        let app = create_router(engine.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/write/quotes",
                serde_json::json!([{"at": 5_000, "bid": 1.5}]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        engine.apply_job().apply_table(&table);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/tables/quotes/rows")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let rows = body_json(response).await;
        assert_eq!(rows["rows"][0]["at"], 5_000);
        assert_eq!(rows["rows"][0]["bid"], 1.5);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let dir = TempDir::new().unwrap();
        let app = create_router(engine(&dir));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/tables/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(post_json("/write/cpu", serde_json::json!([])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        app.clone()
            .oneshot(post_json(
                "/write/cpu",
                serde_json::json!([{"timestamp": 1, "usage": 1.0}]),
            ))
            .await
            .unwrap();
        let response = app
            .oneshot(post_json(
                "/write/cpu",
                serde_json::json!([{"timestamp": 2, "usage": "high"}]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert!(error["error"]
            .as_str()
            .unwrap()
            .contains("cast error from protocol type: STRING to column type: DOUBLE"));
    }
}
