//! Document processing pipeline: resolve engine, recognize, persist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{OutputFormat, Settings};
use crate::convert;
use crate::engine::{Layout, Metadata, OcrBlock, OcrResult};
use crate::factory::EngineFactory;

/// File extensions the processor accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["pdf", "png", "jpg", "jpeg", "tiff", "tif", "bmp", "webp"];

fn is_false(value: &bool) -> bool {
    !*value
}

/// Outcome of a file-based processing request. Failures are carried in
/// `success`/`error`, never returned as `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    pub input_file: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_engine: Option<String>,
}

impl ProcessOutcome {
    fn failure(input_file: &Path, engine: Option<&str>, error: String) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            success: false,
            engine: engine.map(String::from),
            input_file: input_file.display().to_string(),
            outputs: HashMap::new(),
            confidence: None,
            metadata: None,
            error: Some(error),
            fallback_used: false,
            requested_engine: None,
        }
    }
}

/// Outcome of an in-memory processing request: the result record fields are
/// carried inline, nothing is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct BytesOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<OcrBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_engine: Option<String>,
}

impl BytesOutcome {
    fn failure(engine: Option<String>, error: String) -> Self {
        Self {
            success: false,
            engine,
            text: None,
            confidence: None,
            blocks: Vec::new(),
            layout: None,
            metadata: None,
            error: Some(error),
            fallback_used: false,
            requested_engine: None,
        }
    }
}

/// Main pipeline: factory resolution, recognition, format conversion and
/// persistence.
pub struct DocumentProcessor {
    factory: Arc<EngineFactory>,
    settings: Settings,
}

impl DocumentProcessor {
    pub fn new(factory: Arc<EngineFactory>, settings: Settings) -> Self {
        Self { factory, settings }
    }

    /// Process one document and persist the requested output formats.
    pub async fn process_document(
        &self,
        file_path: &Path,
        engine_id: Option<&str>,
        formats: Option<&[OutputFormat]>,
    ) -> ProcessOutcome {
        if !file_path.exists() {
            return ProcessOutcome::failure(
                file_path,
                None,
                format!("File not found: {}", file_path.display()),
            );
        }
        if !is_supported(file_path) {
            let extension = file_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            return ProcessOutcome::failure(
                file_path,
                None,
                format!("Unsupported file format: .{extension}"),
            );
        }

        let requested = engine_id.unwrap_or(&self.settings.default_engine);
        let config = self.settings.engine_config(requested);
        let engine = match self.factory.create_engine(requested, &config, true, true).await {
            Ok(engine) => engine,
            Err(err) => {
                error!("failed to resolve engine '{requested}': {err}");
                return ProcessOutcome::failure(file_path, Some(requested), err.to_string());
            }
        };
        let fallback_used = engine.name() != requested;

        info!("processing {} with {}", file_path.display(), engine.name());
        let result = match engine.process(file_path).await {
            Ok(result) => result,
            Err(err) => {
                error!("processing failed for {}: {err:#}", file_path.display());
                let mut outcome =
                    ProcessOutcome::failure(file_path, Some(engine.name()), format!("{err:#}"));
                outcome.fallback_used = fallback_used;
                outcome.requested_engine = fallback_used.then(|| requested.to_string());
                return outcome;
            }
        };

        let formats = formats.unwrap_or(self.settings.output_formats.as_slice());
        let outputs = match self.save_results(file_path, &result, formats).await {
            Ok(outputs) => outputs,
            Err(err) => {
                return ProcessOutcome::failure(
                    file_path,
                    Some(engine.name()),
                    format!("{err:#}"),
                )
            }
        };

        if config.memory_cleanup {
            engine.cleanup().await;
        }

        ProcessOutcome {
            request_id: Uuid::new_v4(),
            success: true,
            engine: Some(engine.name().to_string()),
            input_file: file_path.display().to_string(),
            outputs,
            confidence: Some(result.confidence),
            metadata: Some(result.metadata),
            error: None,
            fallback_used,
            requested_engine: fallback_used.then(|| requested.to_string()),
        }
    }

    /// Process raw image bytes without persistence.
    pub async fn process_bytes(&self, bytes: &[u8], engine_id: Option<&str>) -> BytesOutcome {
        let requested = engine_id.unwrap_or(&self.settings.default_engine);
        let config = self.settings.engine_config(requested);
        let engine = match self.factory.create_engine(requested, &config, true, true).await {
            Ok(engine) => engine,
            Err(err) => {
                error!("failed to resolve engine '{requested}': {err}");
                return BytesOutcome::failure(Some(requested.to_string()), err.to_string());
            }
        };
        let fallback_used = engine.name() != requested;

        match engine.process_bytes(bytes).await {
            Ok(result) => {
                if config.memory_cleanup {
                    engine.cleanup().await;
                }
                BytesOutcome {
                    success: true,
                    engine: Some(engine.name().to_string()),
                    text: Some(result.text),
                    confidence: Some(result.confidence),
                    blocks: result.blocks,
                    layout: result.layout,
                    metadata: Some(result.metadata),
                    error: None,
                    fallback_used,
                    requested_engine: fallback_used.then(|| requested.to_string()),
                }
            }
            Err(err) => {
                error!("processing failed: {err:#}");
                BytesOutcome::failure(Some(engine.name().to_string()), format!("{err:#}"))
            }
        }
    }

    /// Process every supported file under a directory. Unsupported files are
    /// filtered out, not reported; each file's outcome is independent.
    pub async fn batch_process(
        &self,
        input_dir: &Path,
        engine_id: Option<&str>,
        recursive: bool,
        formats: Option<&[OutputFormat]>,
    ) -> Vec<ProcessOutcome> {
        if !input_dir.is_dir() {
            return vec![ProcessOutcome::failure(
                input_dir,
                None,
                format!("Directory not found: {}", input_dir.display()),
            )];
        }

        let mut files = Vec::new();
        collect_supported(input_dir, recursive, &mut files);
        if files.is_empty() {
            return vec![ProcessOutcome::failure(
                input_dir,
                None,
                "No supported files found".to_string(),
            )];
        }
        files.sort();

        info!("batch: {} documents to process", files.len());
        let mut outcomes = Vec::with_capacity(files.len());
        for (index, file) in files.iter().enumerate() {
            info!("[{}/{}] {}", index + 1, files.len(), file.display());
            outcomes.push(self.process_document(file, engine_id, formats).await);
        }
        outcomes
    }

    async fn save_results(
        &self,
        input_path: &Path,
        result: &OcrResult,
        formats: &[OutputFormat],
    ) -> anyhow::Result<HashMap<String, String>> {
        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .with_context(|| {
                format!("failed to create output dir {}", self.settings.output_dir.display())
            })?;

        let stem = input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let base_name = format!("{stem}_{timestamp}");

        let mut outputs = HashMap::new();
        for format in formats {
            let path = self
                .settings
                .output_dir
                .join(format!("{base_name}.{}", format.extension()));
            let content = match format {
                OutputFormat::Markdown => convert::to_markdown(result),
                OutputFormat::Json => convert::to_json(result, true)?,
            };
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("saved {}", path.display());
            outputs.insert(format.as_str().to_string(), path.display().to_string());
        }
        Ok(outputs)
    }
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn collect_supported(dir: &Path, recursive: bool, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_supported(&path, recursive, files);
            }
        } else if is_supported(&path) {
            files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{
        EngineDescriptor, EngineKind, Layout, Metadata, OcrEngine, OcrResult,
    };

    struct FixedTextEngine {
        id: String,
    }

    #[async_trait::async_trait]
    impl OcrEngine for FixedTextEngine {
        fn name(&self) -> &str {
            &self.id
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn process_bytes(&self, _bytes: &[u8]) -> anyhow::Result<OcrResult> {
            Ok(OcrResult {
                text: "recognized text".to_string(),
                confidence: 0.91,
                blocks: Vec::new(),
                layout: Some(Layout {
                    structured_text: Some("# Recognized\n\ntext".to_string()),
                    ..Default::default()
                }),
                metadata: Metadata::new(&self.id, "cpu", vec!["en".into()]),
            })
        }
    }

    fn descriptor(id: &str) -> EngineDescriptor {
        EngineDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            kind: EngineKind::Traditional,
            languages: vec![],
            gpu_required: false,
            cost_per_page: 0.0,
        }
    }

    fn register_fixed(factory: &EngineFactory, id: &str) {
        let owned = id.to_string();
        factory.register(
            descriptor(id),
            Box::new(move |_config| {
                Ok(Arc::new(FixedTextEngine { id: owned.clone() }) as Arc<dyn OcrEngine>)
            }),
        );
    }

    fn processor_with_mock(output_dir: &Path) -> DocumentProcessor {
        let factory = Arc::new(EngineFactory::new());
        register_fixed(&factory, "mock");
        let settings = Settings {
            default_engine: "mock".to_string(),
            output_dir: output_dir.to_path_buf(),
            engines: HashMap::from([("mock".to_string(), EngineConfig::default())]),
            ..Default::default()
        };
        DocumentProcessor::new(factory, settings)
    }

    #[tokio::test]
    async fn missing_file_is_a_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_with_mock(dir.path());

        let outcome = processor
            .process_document(Path::new("missing.pdf"), None, None)
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn unsupported_extension_is_a_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("doc.xyz");
        std::fs::write(&input, b"data").unwrap();
        let processor = processor_with_mock(dir.path());

        let outcome = processor.process_document(&input, None, None).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Unsupported"));
    }

    #[tokio::test]
    async fn process_document_persists_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.png");
        std::fs::write(&input, b"fake png").unwrap();
        let output_dir = dir.path().join("out");
        let processor = processor_with_mock(&output_dir);

        let outcome = processor
            .process_document(&input, None, Some(&[OutputFormat::Markdown, OutputFormat::Json]))
            .await;

        assert!(outcome.success, "outcome: {:?}", outcome.error);
        assert_eq!(outcome.engine.as_deref(), Some("mock"));
        assert!(!outcome.fallback_used);
        assert_eq!(outcome.confidence, Some(0.91));

        let markdown_path = PathBuf::from(&outcome.outputs["markdown"]);
        let markdown = std::fs::read_to_string(&markdown_path).unwrap();
        // Markdown output prefers the structured reading order.
        assert_eq!(markdown, "# Recognized\n\ntext");

        let json_path = PathBuf::from(&outcome.outputs["json"]);
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json["text"], "recognized text");
    }

    #[tokio::test]
    async fn process_bytes_carries_result_fields_inline() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_with_mock(dir.path());

        let outcome = processor.process_bytes(b"fake png", None).await;

        assert!(outcome.success);
        assert_eq!(outcome.text.as_deref(), Some("recognized text"));
        assert_eq!(outcome.confidence, Some(0.91));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn batch_skips_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("docs");
        std::fs::create_dir_all(input_dir.join("nested")).unwrap();
        std::fs::write(input_dir.join("a.png"), b"one").unwrap();
        std::fs::write(input_dir.join("b.txt"), b"skip me").unwrap();
        std::fs::write(input_dir.join("nested/c.jpg"), b"two").unwrap();
        let processor = processor_with_mock(&dir.path().join("out"));

        let outcomes = processor.batch_process(&input_dir, None, true, None).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.success));

        // Non-recursive run sees only the top-level file.
        let shallow = processor.batch_process(&input_dir, None, false, None).await;
        assert_eq!(shallow.len(), 1);
    }

    #[tokio::test]
    async fn batch_missing_directory_is_single_failure() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_with_mock(dir.path());

        let outcomes = processor
            .batch_process(Path::new("nowhere"), None, true, None)
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
    }

    #[tokio::test]
    async fn fallback_substitution_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.png");
        std::fs::write(&input, b"fake png").unwrap();

        let factory = Arc::new(
            EngineFactory::new().with_fallback_chain(vec!["mock".to_string()]),
        );
        register_fixed(&factory, "mock");
        let settings = Settings {
            default_engine: "offline-engine".to_string(),
            output_dir: dir.path().join("out"),
            ..Default::default()
        };
        let processor = DocumentProcessor::new(factory, settings);

        let outcome = processor.process_document(&input, None, None).await;

        assert!(outcome.success);
        assert!(outcome.fallback_used);
        assert_eq!(outcome.engine.as_deref(), Some("mock"));
        assert_eq!(outcome.requested_engine.as_deref(), Some("offline-engine"));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(is_supported(Path::new("A.PDF")));
        assert!(is_supported(Path::new("b.Jpeg")));
        assert!(!is_supported(Path::new("c.docx")));
        assert!(!is_supported(Path::new("no_extension")));
    }
}
