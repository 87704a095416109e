//! Tesseract sidecar engine (word-level traditional OCR).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    detect_regions, mean_confidence, sniff_mime, BlockType, BoundingBox, EngineDescriptor,
    EngineKind, Layout, Metadata, OcrBlock, OcrEngine, OcrResult, TESSERACT,
};
use crate::config::EngineConfig;

const DEFAULT_URL: &str = "http://localhost:8821";

/// Always registered: the sidecar is part of the default deployment.
pub fn probe() -> anyhow::Result<EngineDescriptor> {
    Ok(EngineDescriptor {
        id: TESSERACT.to_string(),
        name: "Tesseract".to_string(),
        description: "Classic OCR engine, lightweight and fast".to_string(),
        kind: EngineKind::Traditional,
        languages: vec!["fr".into(), "en".into(), "100+ languages".into()],
        gpu_required: false,
        cost_per_page: 0.0,
    })
}

// ── Sidecar wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<SidecarWord>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SidecarWord {
    text: String,
    confidence: f64,
    #[serde(default)]
    bbox: Option<[i32; 4]>,
}

pub struct TesseractEngine {
    endpoint: String,
    languages: Vec<String>,
    device: &'static str,
    client: reqwest::Client,
    timeout: Duration,
    initialized: AtomicBool,
}

impl TesseractEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| std::env::var("TESSERACT_OCR_URL").ok())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        if endpoint.is_empty() {
            anyhow::bail!("tesseract sidecar endpoint is empty");
        }

        Ok(Self {
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
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        TESSERACT
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
            .with_context(|| format!("tesseract sidecar unreachable at {}", self.endpoint))?;
        if !response.status().is_success() {
            anyhow::bail!("tesseract sidecar health check failed: {}", response.status());
        }

        info!("tesseract sidecar ready at {}", self.endpoint);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn process_bytes(&self, bytes: &[u8]) -> anyhow::Result<OcrResult> {
        use reqwest::multipart::{Form, Part};

        let part = Part::bytes(bytes.to_vec())
            .file_name("document")
            .mime_str(sniff_mime(bytes))?;
        let form = Form::new()
            .part("file", part)
            .text("languages", self.languages.join("+"));

        let response = self
            .client
            .post(format!("{}/ocr", self.endpoint))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("tesseract sidecar error ({status}): {body}");
        }

        let sidecar: SidecarResponse = response
            .json()
            .await
            .context("invalid tesseract sidecar response")?;

        let blocks: Vec<OcrBlock> = sidecar
            .words
            .into_iter()
            .filter(|w| !w.text.trim().is_empty() && w.confidence > 0.0)
            .map(|w| OcrBlock {
                text: w.text,
                confidence: w.confidence,
                bbox: w.bbox.map(|[x1, y1, x2, y2]| BoundingBox { x1, y1, x2, y2 }),
                block_type: Some(BlockType::Word),
                page: None,
            })
            .collect();

        let confidence = mean_confidence(&blocks);
        let word_count = blocks.len();
        let text = sidecar.text.trim().to_string();
        let regions = sidecar
            .height
            .map(|h| detect_regions(&blocks, h))
            .unwrap_or_default();

        debug!("tesseract: {word_count} words, confidence {confidence:.4}");

        Ok(OcrResult {
            layout: Some(Layout {
                width: sidecar.width,
                height: sidecar.height,
                regions,
                structured_text: Some(text.clone()),
                extra: serde_json::Value::Null,
            }),
            metadata: Metadata::new(TESSERACT, self.device, self.languages.clone())
                .with("word_count", word_count),
            text,
            confidence,
            blocks,
        })
    }
}
