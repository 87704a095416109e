//! OCR Gateway - multi-engine OCR routing server.

mod compare;
mod config;
mod convert;
mod engine;
mod error;
mod factory;
mod hardware;
mod processor;
mod select;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{OutputFormat, Settings};
use factory::EngineFactory;
use processor::DocumentProcessor;
use select::{auto_select, Complexity, Priority};

const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    factory: Arc<EngineFactory>,
    processor: Arc<DocumentProcessor>,
    settings: Arc<Settings>,
    http: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocr_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load settings (optional JSON file + env overrides)
    let config_path = std::env::var("OCR_CONFIG").ok().map(std::path::PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;
    info!("default engine: {}", settings.default_engine);

    // Probe and register engines once at startup
    let factory = Arc::new(EngineFactory::new());
    factory.ensure_registered();
    info!("available engines: {:?}", factory.get_available_engines());

    // Build application state
    let state = AppState {
        processor: Arc::new(DocumentProcessor::new(factory.clone(), settings.clone())),
        settings: Arc::new(settings),
        factory,
        http: reqwest::Client::new(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/ocr/engines", get(list_engines))
        .route("/api/v1/ocr/process", post(process_multipart))
        .route("/api/v1/ocr/process/json", post(process_json))
        .route("/api/v1/ocr/batch", post(batch_process))
        .route("/api/v1/ocr/compare", post(compare_engines))
        .route("/api/v1/ocr/cost-estimate", get(cost_estimate))
        .route("/api/v1/system/device", get(device_info))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
    info!("OCR gateway listening on http://0.0.0.0:8000");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "ocr-gateway",
        "version": API_VERSION,
        "engines": state.factory.get_available_engines(),
    }))
}

/// List registered engines with capability descriptors.
async fn list_engines(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engines = state.factory.descriptors();
    let total = engines.len();
    Json(json!({
        "engines": engines,
        "default": state.settings.default_engine,
        "total": total,
    }))
}

/// Hints driving auto-selection when `engine=auto`.
#[derive(Debug, Default)]
struct SelectionHints {
    priority: Priority,
    document_type: Option<String>,
    complexity: Complexity,
    has_gpu: Option<bool>,
}

fn resolve_engine(requested: &str, hints: &SelectionHints) -> String {
    if requested != "auto" {
        return requested.to_string();
    }
    let has_gpu = hints.has_gpu.unwrap_or_else(hardware::has_gpu);
    let selected = auto_select(
        hints.priority,
        hints.document_type.as_deref(),
        hints.complexity,
        has_gpu,
    );
    info!("auto-selected engine: {selected}");
    selected.to_string()
}

/// Process an uploaded document (multipart form).
async fn process_multipart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<processor::BytesOutcome>, (StatusCode, String)> {
    let mut file_data = Vec::new();
    let mut engine = "auto".to_string();
    let mut hints = SelectionHints::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file_data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {e}")))?
                    .to_vec();
            }
            "engine" => engine = read_text_field(field).await?,
            "priority" => {
                let value = read_text_field(field).await?;
                hints.priority = Priority::parse(&value)
                    .ok_or((StatusCode::BAD_REQUEST, format!("Unknown priority: {value}")))?;
            }
            "document_type" => hints.document_type = Some(read_text_field(field).await?),
            "complexity" => {
                let value = read_text_field(field).await?;
                hints.complexity = Complexity::parse(&value)
                    .ok_or((StatusCode::BAD_REQUEST, format!("Unknown complexity: {value}")))?;
            }
            _ => {}
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    let engine = resolve_engine(&engine, &hints);
    info!("received {} bytes for engine {engine}", file_data.len());
    Ok(Json(state.processor.process_bytes(&file_data, Some(&engine)).await))
}

#[derive(serde::Deserialize)]
struct ProcessJsonRequest {
    image_base64: Option<String>,
    image_url: Option<String>,
    #[serde(default = "default_auto")]
    engine: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    document_type: Option<String>,
    #[serde(default)]
    complexity: Complexity,
    #[serde(default)]
    has_gpu: Option<bool>,
}

fn default_auto() -> String {
    "auto".to_string()
}

/// Process a document supplied as base64 or by URL (JSON body).
async fn process_json(
    State(state): State<AppState>,
    Json(request): Json<ProcessJsonRequest>,
) -> Result<Json<processor::BytesOutcome>, (StatusCode, String)> {
    let bytes = fetch_image_bytes(
        &state.http,
        request.image_base64.as_deref(),
        request.image_url.as_deref(),
    )
    .await?;

    let hints = SelectionHints {
        priority: request.priority,
        document_type: request.document_type.clone(),
        complexity: request.complexity,
        has_gpu: request.has_gpu,
    };
    let engine = resolve_engine(&request.engine, &hints);
    Ok(Json(state.processor.process_bytes(&bytes, Some(&engine)).await))
}

#[derive(serde::Deserialize)]
struct BatchRequest {
    input_dir: String,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default = "default_recursive")]
    recursive: bool,
    #[serde(default)]
    formats: Option<Vec<String>>,
}

fn default_recursive() -> bool {
    true
}

/// Process every supported document under a server-side directory,
/// persisting the requested output formats per file.
async fn batch_process(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let formats = match &request.formats {
        Some(names) => {
            let mut formats = Vec::with_capacity(names.len());
            for name in names {
                formats.push(OutputFormat::parse(name).ok_or((
                    StatusCode::BAD_REQUEST,
                    format!("Unknown output format: {name}"),
                ))?);
            }
            Some(formats)
        }
        None => None,
    };

    let outcomes = state
        .processor
        .batch_process(
            std::path::Path::new(&request.input_dir),
            request.engine.as_deref(),
            request.recursive,
            formats.as_deref(),
        )
        .await;

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    Ok(Json(json!({
        "total": outcomes.len(),
        "succeeded": succeeded,
        "failed": outcomes.len() - succeeded,
        "results": outcomes,
    })))
}

/// Compare several engines on the same uploaded document.
async fn compare_engines(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let mut file_data = Vec::new();
    let mut engines = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file_data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {e}")))?
                    .to_vec();
            }
            "engines" => engines = read_text_field(field).await?,
            _ => {}
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    let mut engine_list: Vec<String> = engines
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if engine_list.is_empty() {
        engine_list = state
            .factory
            .get_available_engines()
            .into_iter()
            .take(3)
            .collect();
    }

    let results = compare::compare(&state.factory, &state.settings, &file_data, &engine_list).await;
    let success = results.iter().any(|r| r.success);
    Ok(Json(json!({ "success": success, "results": results })))
}

#[derive(serde::Deserialize)]
struct CostEstimateQuery {
    #[serde(default = "default_cost_engine")]
    engine: String,
    #[serde(default = "default_page_count")]
    page_count: u64,
}

fn default_cost_engine() -> String {
    engine::MISTRAL_OCR.to_string()
}

fn default_page_count() -> u64 {
    1
}

/// Cost estimate for API-based engines; zero-cost engines report free.
async fn cost_estimate(
    State(state): State<AppState>,
    Query(query): Query<CostEstimateQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let descriptor = state
        .factory
        .descriptor(&query.engine)
        .ok_or((StatusCode::NOT_FOUND, format!("Engine not found: {}", query.engine)))?;

    Ok(Json(json!({
        "engine": descriptor.id,
        "page_count": query.page_count,
        "cost_per_page": descriptor.cost_per_page,
        "estimated_cost_usd": descriptor.cost_per_page * query.page_count as f64,
        "is_free": descriptor.cost_per_page == 0.0,
    })))
}

/// Detected compute device for the host.
async fn device_info() -> Json<hardware::DeviceInfo> {
    Json(hardware::device_info())
}

// ============================================================================
// Helper functions
// ============================================================================

async fn read_text_field(
    field: axum::extract::multipart::Field<'_>,
) -> Result<String, (StatusCode, String)> {
    field
        .text()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid field: {e}")))
}

/// Resolve the request's image source to raw bytes.
async fn fetch_image_bytes(
    http: &reqwest::Client,
    image_base64: Option<&str>,
    image_url: Option<&str>,
) -> Result<Vec<u8>, (StatusCode, String)> {
    if let Some(encoded) = image_base64 {
        return BASE64
            .decode(encoded)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid base64: {e}")));
    }

    if let Some(url) = image_url {
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to fetch image: {e}")))?;
        if !response.status().is_success() {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Failed to fetch image: HTTP {}", response.status()),
            ));
        }
        return response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read image: {e}")));
    }

    Err((
        StatusCode::BAD_REQUEST,
        "No image provided (image_base64 or image_url required)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_engine_bypasses_auto_selection() {
        let hints = SelectionHints::default();
        assert_eq!(resolve_engine("paddleocr", &hints), "paddleocr");
    }

    #[test]
    fn auto_uses_hints() {
        let hints = SelectionHints {
            priority: Priority::Accuracy,
            document_type: Some("invoice".to_string()),
            complexity: Complexity::Medium,
            has_gpu: Some(false),
        };
        assert_eq!(resolve_engine("auto", &hints), engine::MISTRAL_OCR);
    }

    #[tokio::test]
    async fn fetch_image_bytes_decodes_base64() {
        let client = reqwest::Client::new();
        let encoded = BASE64.encode(b"image-bytes");

        let bytes = fetch_image_bytes(&client, Some(&encoded), None).await.unwrap();
        assert_eq!(bytes, b"image-bytes");

        let err = fetch_image_bytes(&client, Some("not base64!!"), None)
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = fetch_image_bytes(&client, None, None).await.unwrap_err();
        assert!(err.1.contains("No image provided"));
    }
}
