//! Mistral OCR engine (hosted API).
//!
//! Transient failures (HTTP 5xx, 429, transport errors) are retried with
//! exponential backoff up to a configured attempt cap; any other 4xx fails
//! immediately. Backoff suspends on the runtime, never blocks a worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    image_dimensions, sniff_mime, BlockType, EngineDescriptor, EngineKind, Layout, Metadata,
    OcrBlock, OcrEngine, OcrResult, MISTRAL_OCR,
};
use crate::config::EngineConfig;

const DEFAULT_API_URL: &str = "https://api.mistral.ai/v1/ocr";
const DEFAULT_MODEL: &str = "mistral-ocr-latest";

/// Used when the API reports no overall score.
const DEFAULT_CONFIDENCE: f64 = 0.9;

pub const COST_PER_PAGE: f64 = 0.002;

pub fn probe() -> anyhow::Result<EngineDescriptor> {
    std::env::var("MISTRAL_API_KEY").context("MISTRAL_API_KEY not set")?;
    Ok(EngineDescriptor {
        id: MISTRAL_OCR.to_string(),
        name: "Mistral OCR".to_string(),
        description: "API-based OCR by Mistral AI, excellent for structured data extraction"
            .to_string(),
        kind: EngineKind::Api,
        languages: vec!["fr".into(), "en".into(), "de".into(), "es".into(), "100+ languages".into()],
        gpu_required: false,
        cost_per_page: COST_PER_PAGE,
    })
}

// ── Mistral API request/response types ──────────────────────────────────────

#[derive(Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: DocumentPayload,
    options: OcrOptions,
}

#[derive(Serialize)]
struct DocumentPayload {
    #[serde(rename = "type")]
    kind: &'static str,
    image_url: String,
}

#[derive(Serialize)]
struct OcrOptions {
    extract_tables: bool,
    extract_structure: bool,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    pages: Vec<OcrPage>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct OcrPage {
    index: u32,
    markdown: String,
}

// ── Engine implementation ───────────────────────────────────────────────────

pub struct MistralOcrEngine {
    api_key: String,
    api_url: String,
    model: String,
    languages: Vec<String>,
    extract_tables: bool,
    retry_attempts: u32,
    initial_backoff: Duration,
    timeout: Duration,
    client: reqwest::Client,
    initialized: AtomicBool,
    pages_processed: AtomicU64,
}

impl MistralOcrEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("MISTRAL_API_KEY").ok())
            .context("Mistral API key is required (set MISTRAL_API_KEY or 'api_key' in config)")?;

        Ok(Self {
            api_key,
            api_url: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            languages: config.languages.clone(),
            extract_tables: config.extract_tables,
            retry_attempts: config.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
            initialized: AtomicBool::new(false),
            pages_processed: AtomicU64::new(0),
        })
    }

    async fn send_with_retry(&self, request: &OcrRequest<'_>) -> anyhow::Result<OcrResponse> {
        let mut backoff = self.initial_backoff;
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            let sent = self
                .client
                .post(&self.api_url)
                .bearer_auth(&self.api_key)
                .json(request)
                .timeout(self.timeout)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    warn!("mistral_ocr attempt {attempt} transport error: {err}");
                    last_error = Some(anyhow::Error::new(err));
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff * 2);
                warn!("mistral_ocr rate limited, waiting {retry_after:?}");
                last_error = Some(anyhow::anyhow!("rate limited ({status})"));
                tokio::time::sleep(retry_after).await;
                backoff *= 2;
                continue;
            }
            if status.is_server_error() {
                warn!("mistral_ocr server error {status}, retrying");
                last_error = Some(anyhow::anyhow!("server error ({status})"));
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }
            if status.is_client_error() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Mistral OCR API error ({status}): {body}");
            }

            return response
                .json::<OcrResponse>()
                .await
                .context("invalid Mistral OCR response");
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("no attempt made"))
            .context(format!("all {} attempts failed", self.retry_attempts)))
    }
}

#[async_trait::async_trait]
impl OcrEngine for MistralOcrEngine {
    fn name(&self) -> &str {
        MISTRAL_OCR
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.api_key.is_empty() {
            anyhow::bail!("Mistral API key is empty");
        }
        info!("mistral_ocr configured: model={}", self.model);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn process_bytes(&self, bytes: &[u8]) -> anyhow::Result<OcrResult> {
        let mime = sniff_mime(bytes);
        let request = OcrRequest {
            model: &self.model,
            document: DocumentPayload {
                kind: "image_url",
                image_url: format!("data:{mime};base64,{}", BASE64.encode(bytes)),
            },
            options: OcrOptions {
                extract_tables: self.extract_tables,
                extract_structure: true,
            },
        };

        info!("mistral_ocr: calling OCR API");
        let response = self.send_with_retry(&request).await?;

        let pages_processed = self
            .pages_processed
            .fetch_add(response.pages.len() as u64, Ordering::Relaxed)
            + response.pages.len() as u64;

        let metadata = Metadata::new(MISTRAL_OCR, "api", self.languages.clone())
            .with("model", self.model.clone())
            .with("pages_processed", pages_processed)
            .with("estimated_cost_usd", pages_processed as f64 * COST_PER_PAGE);

        if response.pages.is_empty() {
            return Ok(OcrResult::empty(metadata));
        }

        let confidence = response.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let text = response
            .pages
            .iter()
            .map(|p| p.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let blocks: Vec<OcrBlock> = response
            .pages
            .iter()
            .map(|p| OcrBlock {
                text: p.markdown.clone(),
                confidence,
                bbox: None,
                block_type: Some(BlockType::Paragraph),
                page: Some(p.index + 1),
            })
            .collect();

        let (width, height) = match image_dimensions(bytes) {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };

        Ok(OcrResult {
            confidence,
            blocks,
            layout: Some(Layout {
                width,
                height,
                regions: Vec::new(),
                structured_text: Some(text.clone()),
                extra: serde_json::Value::Null,
            }),
            metadata,
            text,
        })
    }

    async fn cleanup(&self) {
        // API-based engine holds no local resources.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Stub OCR endpoint: fails `failures` times with `fail_status`, then
    /// answers one page of markdown.
    async fn spawn_stub(failures: usize, fail_status: u16, hits: Arc<AtomicUsize>) -> String {
        let handler = move || {
            let hits = hits.clone();
            async move {
                let seen = hits.fetch_add(1, Ordering::SeqCst);
                if seen < failures {
                    (
                        axum::http::StatusCode::from_u16(fail_status).unwrap(),
                        Json(serde_json::json!({"error": "boom"})),
                    )
                        .into_response()
                } else {
                    Json(serde_json::json!({
                        "pages": [{"index": 0, "markdown": "recovered"}]
                    }))
                    .into_response()
                }
            }
        };

        let app = Router::new().route("/v1/ocr", post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/ocr")
    }

    fn engine_for(url: String, retry_attempts: u32) -> MistralOcrEngine {
        let config = EngineConfig {
            api_key: Some("test-key".to_string()),
            endpoint: Some(url),
            retry_attempts,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        MistralOcrEngine::new(&config).unwrap()
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub(3, 500, hits.clone()).await;

        let engine = engine_for(url, 5);
        let result = engine.process_bytes(b"fake-image").await.unwrap();

        assert_eq!(result.text, "recovered");
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].page, Some(1));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub(1, 429, hits.clone()).await;

        let engine = engine_for(url, 3);
        let result = engine.process_bytes(b"fake-image").await.unwrap();

        assert_eq!(result.text, "recovered");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_error_fails_without_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub(usize::MAX, 400, hits.clone()).await;

        let engine = engine_for(url, 5);
        let err = engine.process_bytes(b"fake-image").await.unwrap_err();

        assert!(err.to_string().contains("400"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub(usize::MAX, 503, hits.clone()).await;

        let engine = engine_for(url, 2);
        let err = engine.process_bytes(b"fake-image").await.unwrap_err();

        assert!(err.to_string().contains("all 2 attempts failed"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cost_tracking_accumulates_across_calls() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub(0, 500, hits.clone()).await;

        let engine = engine_for(url, 1);
        let first = engine.process_bytes(b"fake-image").await.unwrap();
        let second = engine.process_bytes(b"fake-image").await.unwrap();

        assert_eq!(first.metadata.extra["pages_processed"], 1);
        assert_eq!(second.metadata.extra["pages_processed"], 2);
    }

    #[test]
    fn constructor_requires_api_key() {
        if std::env::var("MISTRAL_API_KEY").is_ok() {
            // Key comes from the environment on configured hosts.
            return;
        }
        assert!(MistralOcrEngine::new(&EngineConfig::default()).is_err());
    }
}
