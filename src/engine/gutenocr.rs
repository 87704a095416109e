//! GutenOCR inference-server engine (VLM based on Qwen2.5-VL).
//!
//! One adapter covers both registered variants, parameterized by model size:
//! `gutenocr-3b` (fast, CPU-capable) and `gutenocr-7b` (high accuracy, GPU).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    image_dimensions, EngineDescriptor, EngineKind, Layout, Metadata, OcrEngine, OcrResult,
    GUTENOCR_3B, GUTENOCR_7B,
};
use crate::config::EngineConfig;

const DEFAULT_URL: &str = "http://localhost:8823";

/// VLMs report no per-region scores; a fixed heuristic stands in.
const VLM_CONFIDENCE: f64 = 0.90;

pub fn probe() -> anyhow::Result<Vec<EngineDescriptor>> {
    Ok(vec![
        EngineDescriptor {
            id: GUTENOCR_3B.to_string(),
            name: "GutenOCR 3B".to_string(),
            description: "VLM-based OCR, 3B parameters, good for standard documents".to_string(),
            kind: EngineKind::Vlm,
            languages: vec!["fr".into(), "en".into(), "de".into(), "es".into(), "100+ languages".into()],
            gpu_required: false,
            cost_per_page: 0.0,
        },
        EngineDescriptor {
            id: GUTENOCR_7B.to_string(),
            name: "GutenOCR 7B".to_string(),
            description: "VLM-based OCR, 7B parameters, high accuracy for complex documents"
                .to_string(),
            kind: EngineKind::Vlm,
            languages: vec!["fr".into(), "en".into(), "de".into(), "es".into(), "100+ languages".into()],
            gpu_required: true,
            cost_per_page: 0.0,
        },
    ])
}

fn prompt_for(output_format: &str) -> &'static str {
    match output_format.to_ascii_uppercase().as_str() {
        "LINES" => "Extract text from this image line by line.",
        "WORDS" => "Extract all words from this image with their positions.",
        "LATEX" => "Extract mathematical expressions in LaTeX format.",
        _ => "Extract all text from this image.",
    }
}

// ── Inference server wire types ─────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    image_base64: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

pub struct GutenOcrEngine {
    id: String,
    model_size: String,
    endpoint: String,
    prompt: &'static str,
    languages: Vec<String>,
    device: &'static str,
    client: reqwest::Client,
    timeout: Duration,
    initialized: AtomicBool,
}

impl GutenOcrEngine {
    pub fn new(config: &EngineConfig, engine_id: &str) -> anyhow::Result<Self> {
        let model_size = engine_id
            .rsplit('-')
            .next()
            .filter(|size| matches!(*size, "3b" | "7b"))
            .with_context(|| format!("unknown gutenocr variant: {engine_id}"))?
            .to_string();

        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| std::env::var("GUTENOCR_URL").ok())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        if endpoint.is_empty() {
            anyhow::bail!("gutenocr endpoint is empty");
        }

        Ok(Self {
            id: engine_id.to_string(),
            prompt: prompt_for(config.output_format.as_deref().unwrap_or("text")),
            model_size,
            endpoint,
            languages: config.languages.clone(),
            device: config.device.resolve(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(config.timeout_secs),
            initialized: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl OcrEngine for GutenOcrEngine {
    fn name(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("gutenocr server unreachable at {}", self.endpoint))?;
        if !response.status().is_success() {
            anyhow::bail!("gutenocr health check failed: {}", response.status());
        }

        info!("gutenocr {} ready at {}", self.model_size, self.endpoint);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn process_bytes(&self, bytes: &[u8]) -> anyhow::Result<OcrResult> {
        let model = format!("gutenocr-{}", self.model_size);
        let request = GenerateRequest {
            model: &model,
            prompt: self.prompt,
            image_base64: BASE64.encode(bytes),
        };

        debug!("gutenocr-{}: calling inference server", self.model_size);

        let response = self
            .client
            .post(format!("{}/v1/generate", self.endpoint))
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gutenocr server error ({status}): {body}");
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .context("invalid gutenocr server response")?;

        let metadata = Metadata::new(&self.id, self.device, self.languages.clone())
            .with("model_size", self.model_size.clone());

        let text = generated.text.trim().to_string();
        if text.is_empty() {
            return Ok(OcrResult::empty(metadata));
        }

        let (width, height) = match image_dimensions(bytes) {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };

        Ok(OcrResult {
            confidence: VLM_CONFIDENCE,
            blocks: Vec::new(),
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parsing_from_engine_id() {
        let engine = GutenOcrEngine::new(&EngineConfig::default(), GUTENOCR_7B).unwrap();
        assert_eq!(engine.model_size, "7b");
        assert_eq!(engine.name(), "gutenocr-7b");

        assert!(GutenOcrEngine::new(&EngineConfig::default(), "gutenocr-70b").is_err());
    }

    #[test]
    fn prompt_follows_output_format() {
        assert_eq!(prompt_for("text"), "Extract all text from this image.");
        assert_eq!(prompt_for("latex"), "Extract mathematical expressions in LaTeX format.");
        assert_eq!(prompt_for("LINES"), "Extract text from this image line by line.");
        // Unknown formats fall back to plain text extraction.
        assert_eq!(prompt_for("mystery"), "Extract all text from this image.");
    }
}
