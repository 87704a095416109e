//! PaddleOCR sidecar engine (line-level traditional OCR with layout).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    detect_regions, mean_confidence, sniff_mime, BlockType, BoundingBox, EngineDescriptor,
    EngineKind, Layout, Metadata, OcrBlock, OcrEngine, OcrResult, PADDLEOCR,
};
use crate::config::EngineConfig;

const DEFAULT_URL: &str = "http://localhost:8822";

/// Always registered: the sidecar is part of the default deployment.
pub fn probe() -> anyhow::Result<EngineDescriptor> {
    Ok(EngineDescriptor {
        id: PADDLEOCR.to_string(),
        name: "PaddleOCR".to_string(),
        description: "High-accuracy OCR with layout detection".to_string(),
        kind: EngineKind::Traditional,
        languages: vec!["fr".into(), "en".into(), "zh".into(), "ar".into(), "80+ languages".into()],
        gpu_required: false,
        cost_per_page: 0.0,
    })
}

// ── Sidecar wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    #[serde(default)]
    lines: Vec<SidecarLine>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

/// A detected line: text, score, and a 4-point polygon in reading order.
#[derive(Debug, Deserialize)]
struct SidecarLine {
    text: String,
    score: f64,
    #[serde(default, rename = "box")]
    quad: Option<[[f64; 2]; 4]>,
}

pub struct PaddleOcrEngine {
    endpoint: String,
    languages: Vec<String>,
    device: &'static str,
    client: reqwest::Client,
    timeout: Duration,
    initialized: AtomicBool,
}

impl PaddleOcrEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| std::env::var("PADDLE_OCR_URL").ok())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        if endpoint.is_empty() {
            anyhow::bail!("paddleocr sidecar endpoint is empty");
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

/// Reduce a 4-point polygon to its bounding box using the top-left and
/// bottom-right corners.
fn quad_to_bbox(quad: [[f64; 2]; 4]) -> BoundingBox {
    BoundingBox {
        x1: quad[0][0] as i32,
        y1: quad[0][1] as i32,
        x2: quad[2][0] as i32,
        y2: quad[2][1] as i32,
    }
}

#[async_trait::async_trait]
impl OcrEngine for PaddleOcrEngine {
    fn name(&self) -> &str {
        PADDLEOCR
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
            .with_context(|| format!("paddleocr sidecar unreachable at {}", self.endpoint))?;
        if !response.status().is_success() {
            anyhow::bail!("paddleocr sidecar health check failed: {}", response.status());
        }

        info!("paddleocr sidecar ready at {}", self.endpoint);
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
            .post(format!("{}/ocr", self.endpoint))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("paddleocr sidecar error ({status}): {body}");
        }

        let sidecar: SidecarResponse = response
            .json()
            .await
            .context("invalid paddleocr sidecar response")?;

        if sidecar.lines.is_empty() {
            return Ok(OcrResult::empty(Metadata::new(
                PADDLEOCR,
                self.device,
                self.languages.clone(),
            )));
        }

        let mut texts = Vec::with_capacity(sidecar.lines.len());
        let mut blocks = Vec::with_capacity(sidecar.lines.len());
        for line in sidecar.lines {
            blocks.push(OcrBlock {
                text: line.text.clone(),
                confidence: line.score,
                bbox: line.quad.map(quad_to_bbox),
                block_type: Some(BlockType::Line),
                page: None,
            });
            texts.push(line.text);
        }

        let text = texts.join("\n");
        let confidence = mean_confidence(&blocks);
        let regions = sidecar
            .height
            .map(|h| detect_regions(&blocks, h))
            .unwrap_or_default();

        debug!("paddleocr: {} lines, confidence {confidence:.4}", blocks.len());

        Ok(OcrResult {
            layout: Some(Layout {
                width: sidecar.width,
                height: sidecar.height,
                regions,
                structured_text: Some(text.clone()),
                extra: serde_json::Value::Null,
            }),
            metadata: Metadata::new(PADDLEOCR, self.device, self.languages.clone())
                .with("line_count", blocks.len()),
            text,
            confidence,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_reduces_to_corner_bbox() {
        let bbox = quad_to_bbox([[10.0, 20.0], [110.0, 20.0], [110.0, 45.0], [10.0, 45.0]]);
        assert_eq!(bbox.x1, 10);
        assert_eq!(bbox.y1, 20);
        assert_eq!(bbox.x2, 110);
        assert_eq!(bbox.y2, 45);
    }

    #[test]
    fn sidecar_line_parses_box_field() {
        let line: SidecarLine = serde_json::from_str(
            r#"{"text": "Total: 42,00", "score": 0.97, "box": [[5,5],[80,5],[80,20],[5,20]]}"#,
        )
        .unwrap();
        assert_eq!(line.text, "Total: 42,00");
        assert!(line.quad.is_some());
    }
}
