//! EasyOCR sidecar engine.
//!
//! Only registered when `EASYOCR_URL` is explicitly set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use super::{
    mean_confidence, sniff_mime, BlockType, BoundingBox, EngineDescriptor, EngineKind, Metadata,
    OcrBlock, OcrEngine, OcrResult, EASYOCR,
};
use crate::config::EngineConfig;

pub fn probe() -> anyhow::Result<EngineDescriptor> {
    std::env::var("EASYOCR_URL").context("EASYOCR_URL not set")?;
    Ok(EngineDescriptor {
        id: EASYOCR.to_string(),
        name: "EasyOCR".to_string(),
        description: "Ready-to-use OCR for images".to_string(),
        kind: EngineKind::Traditional,
        languages: vec!["fr".into(), "en".into(), "80+ languages".into()],
        gpu_required: false,
        cost_per_page: 0.0,
    })
}

// ── Sidecar wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct Detection {
    text: String,
    confidence: f64,
    /// Free-form polygon; reduced to the min/max envelope.
    #[serde(default)]
    points: Vec<[f64; 2]>,
}

pub struct EasyOcrEngine {
    endpoint: String,
    languages: Vec<String>,
    device: &'static str,
    client: reqwest::Client,
    timeout: Duration,
    initialized: AtomicBool,
}

impl EasyOcrEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| std::env::var("EASYOCR_URL").ok())
            .context("easyocr sidecar endpoint is required (EASYOCR_URL or 'endpoint')")?;

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

fn envelope(points: &[[f64; 2]]) -> Option<BoundingBox> {
    if points.is_empty() {
        return None;
    }
    let xs = points.iter().map(|p| p[0]);
    let ys = points.iter().map(|p| p[1]);
    Some(BoundingBox {
        x1: xs.clone().fold(f64::INFINITY, f64::min) as i32,
        y1: ys.clone().fold(f64::INFINITY, f64::min) as i32,
        x2: xs.fold(f64::NEG_INFINITY, f64::max) as i32,
        y2: ys.fold(f64::NEG_INFINITY, f64::max) as i32,
    })
}

#[async_trait::async_trait]
impl OcrEngine for EasyOcrEngine {
    fn name(&self) -> &str {
        EASYOCR
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
            .with_context(|| format!("easyocr sidecar unreachable at {}", self.endpoint))?;
        if !response.status().is_success() {
            anyhow::bail!("easyocr sidecar health check failed: {}", response.status());
        }

        info!("easyocr sidecar ready at {}", self.endpoint);
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
            .text("languages", self.languages.join(","));

        let response = self
            .client
            .post(format!("{}/readtext", self.endpoint))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("easyocr sidecar error ({status}): {body}");
        }

        let sidecar: SidecarResponse = response
            .json()
            .await
            .context("invalid easyocr sidecar response")?;

        if sidecar.detections.is_empty() {
            return Ok(OcrResult::empty(Metadata::new(
                EASYOCR,
                self.device,
                self.languages.clone(),
            )));
        }

        let mut texts = Vec::with_capacity(sidecar.detections.len());
        let mut blocks = Vec::with_capacity(sidecar.detections.len());
        for detection in sidecar.detections {
            blocks.push(OcrBlock {
                text: detection.text.clone(),
                confidence: detection.confidence,
                bbox: envelope(&detection.points),
                block_type: Some(BlockType::Line),
                page: None,
            });
            texts.push(detection.text);
        }

        let text = texts.join("\n");
        let confidence = mean_confidence(&blocks);

        Ok(OcrResult {
            layout: None,
            metadata: Metadata::new(EASYOCR, self.device, self.languages.clone()),
            text,
            confidence,
            blocks,
        })
    }
}
