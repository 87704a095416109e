//! Modular OCR engine abstraction.
//!
//! Defines the [`OcrEngine`] trait and the unified result types so different
//! recognition backends (traditional sidecars, VLM inference servers, the
//! Mistral OCR API) can be swapped via request parameter or auto-selection.

pub mod easyocr;
pub mod gutenocr;
pub mod mistral;
pub mod paddle;
pub mod tesseract;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Engine identifiers used for registry lookup and auto-selection.
pub const TESSERACT: &str = "tesseract";
pub const PADDLEOCR: &str = "paddleocr";
pub const EASYOCR: &str = "easyocr";
pub const GUTENOCR_3B: &str = "gutenocr-3b";
pub const GUTENOCR_7B: &str = "gutenocr-7b";
pub const MISTRAL_OCR: &str = "mistral_ocr";

/// Engines attempted, in order, when a requested engine is unusable.
/// Cheap, dependency-light engines first.
pub const FALLBACK_CHAIN: &[&str] = &[TESSERACT, PADDLEOCR, EASYOCR];

/// Pixel-space bounding box (top-left, bottom-right corners).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Word,
    Line,
    Paragraph,
    Table,
    Latex,
}

/// One recognized text region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Header,
    Body,
    Footer,
}

/// Coarse page region derived from block positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    #[serde(rename = "type")]
    pub kind: RegionKind,
    pub y_start: u32,
    pub y_end: u32,
    pub block_count: usize,
}

/// Layout information attached to a result when the engine reports any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<Region>,
    /// Reading-order text, preferred over raw block order when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_text: Option<String>,
    /// Engine-specific structured output (document tree, merge info, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// Standard metadata attached to every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub engine: String,
    pub device: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn new(engine: impl Into<String>, device: impl Into<String>, languages: Vec<String>) -> Self {
        Self {
            engine: engine.into(),
            device: device.into(),
            languages,
            source: None,
            error: None,
            extra: BTreeMap::new(),
        }
    }

    /// Attach an engine-specific diagnostic field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.extra.insert(key.to_string(), value);
        }
        self
    }
}

/// Unified OCR result returned by every engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub blocks: Vec<OcrBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
    pub metadata: Metadata,
}

impl OcrResult {
    /// Zero confidence and no blocks means "no text detected", not failure.
    pub fn empty(metadata: Metadata) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            blocks: Vec::new(),
            layout: None,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Traditional,
    Vlm,
    Api,
}

/// Capability descriptor registered alongside each engine constructor.
#[derive(Debug, Clone, Serialize)]
pub struct EngineDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: EngineKind,
    pub languages: Vec<String>,
    pub gpu_required: bool,
    pub cost_per_page: f64,
}

/// Async trait implemented by each OCR backend adapter.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    /// Stable lowercase identifier.
    fn name(&self) -> &str;

    /// Verify the backend is reachable and credentials are usable.
    /// Idempotent; the factory calls this once before caching an instance.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Recognize a document from a file on disk.
    async fn process(&self, file_path: &Path) -> anyhow::Result<OcrResult> {
        let bytes = tokio::fs::read(file_path)
            .await
            .with_context(|| format!("failed to read {}", file_path.display()))?;
        let mut result = self.process_bytes(&bytes).await?;
        result.metadata.source = Some(file_path.display().to_string());
        Ok(result)
    }

    /// Recognize a document from raw bytes (JPEG, PNG, PDF, ...).
    async fn process_bytes(&self, bytes: &[u8]) -> anyhow::Result<OcrResult>;

    /// Release transient per-request state. Idempotent, never fails, safe to
    /// call on cached instances.
    async fn cleanup(&self) {}
}

impl std::fmt::Debug for dyn OcrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrEngine").field("name", &self.name()).finish()
    }
}

/// Mean of block confidences, rounded to 4 decimals. Zero without blocks.
pub fn mean_confidence(blocks: &[OcrBlock]) -> f64 {
    if blocks.is_empty() {
        return 0.0;
    }
    let sum: f64 = blocks.iter().map(|b| b.confidence).sum();
    ((sum / blocks.len() as f64) * 10_000.0).round() / 10_000.0
}

/// Split a page into header/body/footer bands from block positions.
///
/// Header is the top 15% of the page, footer the bottom 15%.
pub fn detect_regions(blocks: &[OcrBlock], image_height: u32) -> Vec<Region> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let header_threshold = image_height as f64 * 0.15;
    let footer_threshold = image_height as f64 * 0.85;
    let top = |b: &OcrBlock| b.bbox.map(|bb| bb.y1 as f64).unwrap_or(0.0);

    let header_count = blocks.iter().filter(|b| top(b) < header_threshold).count();
    let footer_count = blocks.iter().filter(|b| top(b) > footer_threshold).count();
    let body_count = blocks.len() - header_count - footer_count;

    let mut regions = Vec::new();
    if header_count > 0 {
        regions.push(Region {
            kind: RegionKind::Header,
            y_start: 0,
            y_end: header_threshold as u32,
            block_count: header_count,
        });
    }
    if body_count > 0 {
        regions.push(Region {
            kind: RegionKind::Body,
            y_start: header_threshold as u32,
            y_end: footer_threshold as u32,
            block_count: body_count,
        });
    }
    if footer_count > 0 {
        regions.push(Region {
            kind: RegionKind::Footer,
            y_start: footer_threshold as u32,
            y_end: image_height,
            block_count: footer_count,
        });
    }

    regions
}

/// Best-effort MIME type from magic bytes. The backends only distinguish
/// pdf/jpeg/png; everything else is sent as png.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        "application/pdf"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else {
        "image/png"
    }
}

/// Pixel dimensions of an image payload, when the format is decodable.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    use image::GenericImageView;
    image::load_from_memory(bytes).ok().map(|img| img.dimensions())
}
