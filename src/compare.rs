//! Side-by-side engine comparison on a single document.

use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::config::Settings;
use crate::factory::EngineFactory;

const PREVIEW_CHARS: usize = 500;

/// One engine's run in a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct CompareOutcome {
    pub engine: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub text_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub block_count: usize,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run each requested engine on the same bytes.
///
/// Fallback substitution is disabled: a comparison must reflect the
/// literally-requested engine. One engine's failure never aborts the others.
pub async fn compare(
    factory: &EngineFactory,
    settings: &Settings,
    bytes: &[u8],
    engine_ids: &[String],
) -> Vec<CompareOutcome> {
    info!("comparing {} engines", engine_ids.len());
    let mut outcomes = Vec::with_capacity(engine_ids.len());
    for id in engine_ids {
        outcomes.push(run_one(factory, settings, bytes, id).await);
    }
    outcomes
}

async fn run_one(
    factory: &EngineFactory,
    settings: &Settings,
    bytes: &[u8],
    id: &str,
) -> CompareOutcome {
    let started = Instant::now();
    let config = settings.engine_config(id);

    let engine = match factory.create_engine(id, &config, false, true).await {
        Ok(engine) => engine,
        Err(err) => return failure(id, started, err.to_string()),
    };

    match engine.process_bytes(bytes).await {
        Ok(result) => CompareOutcome {
            engine: id.to_string(),
            success: true,
            text: Some(result.text.chars().take(PREVIEW_CHARS).collect()),
            text_len: result.text.chars().count(),
            confidence: Some(result.confidence),
            block_count: result.blocks.len(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: None,
        },
        Err(err) => failure(id, started, format!("{err:#}")),
    }
}

fn failure(id: &str, started: Instant, error: String) -> CompareOutcome {
    CompareOutcome {
        engine: id.to_string(),
        success: false,
        text: None,
        text_len: 0,
        confidence: None,
        block_count: 0,
        processing_time_ms: started.elapsed().as_millis() as u64,
        error: Some(error),
    }
}
