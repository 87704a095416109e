#![allow(dead_code)]
//! Result record conversions: markdown, JSON, multi-page merging.

use std::collections::BTreeSet;

use anyhow::Result;
use serde_json::json;

use crate::engine::{Layout, Metadata, OcrBlock, OcrResult};

/// Markdown rendering: reading-order text when the engine supplied one,
/// otherwise the raw linearization.
pub fn to_markdown(result: &OcrResult) -> String {
    if let Some(layout) = &result.layout {
        if let Some(structured) = &layout.structured_text {
            return structured.clone();
        }
    }
    result.text.clone()
}

/// Markdown with a metadata front block.
pub fn to_markdown_annotated(result: &OcrResult, include_confidence: bool) -> String {
    let mut lines = vec!["---".to_string(), "# Document Metadata".to_string()];
    lines.push(format!("- **engine**: {}", result.metadata.engine));
    lines.push(format!("- **device**: {}", result.metadata.device));
    if !result.metadata.languages.is_empty() {
        lines.push(format!("- **languages**: {}", result.metadata.languages.join(", ")));
    }
    if let Some(source) = &result.metadata.source {
        lines.push(format!("- **source**: {source}"));
    }
    for (key, value) in &result.metadata.extra {
        lines.push(format!("- **{key}**: {value}"));
    }
    if include_confidence {
        lines.push(format!("- **confidence**: {:.2}%", result.confidence * 100.0));
    }
    lines.push("---".to_string());
    lines.push(String::new());
    lines.push(to_markdown(result));
    lines.join("\n")
}

/// JSON rendering with block detail optionally stripped.
pub fn to_json(result: &OcrResult, include_blocks: bool) -> Result<String> {
    let mut value = serde_json::to_value(result)?;
    if !include_blocks {
        if let Some(map) = value.as_object_mut() {
            map.remove("blocks");
        }
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Merge per-page results into a single record: texts joined with page
/// breaks, blocks tagged with their page, nonzero confidences averaged.
pub fn merge_results(mut results: Vec<OcrResult>) -> OcrResult {
    if results.is_empty() {
        return OcrResult::empty(Metadata::new("unknown", "cpu", Vec::new()));
    }
    if results.len() == 1 {
        return results.remove(0);
    }

    let page_count = results.len();

    let texts: Vec<&str> = results
        .iter()
        .map(|r| r.text.as_str())
        .filter(|t| !t.is_empty())
        .collect();
    let text = texts.join("\n\n---\n\n");

    let mut blocks = Vec::new();
    for (page, result) in results.iter().enumerate() {
        for block in &result.blocks {
            let mut block = block.clone();
            block.page = Some(page as u32 + 1);
            blocks.push(block);
        }
    }

    let nonzero: Vec<f64> = results
        .iter()
        .map(|r| r.confidence)
        .filter(|c| *c > 0.0)
        .collect();
    let confidence = if nonzero.is_empty() {
        0.0
    } else {
        nonzero.iter().sum::<f64>() / nonzero.len() as f64
    };

    let engines: BTreeSet<String> = results.iter().map(|r| r.metadata.engine.clone()).collect();
    let first = &results[0];
    let metadata = Metadata::new(
        first.metadata.engine.clone(),
        first.metadata.device.clone(),
        first.metadata.languages.clone(),
    )
    .with("page_count", page_count)
    .with("engines", engines.into_iter().collect::<Vec<_>>());

    OcrResult {
        text,
        confidence,
        blocks,
        layout: Some(Layout {
            extra: json!({"merged": true, "page_count": page_count}),
            ..Default::default()
        }),
        metadata,
    }
}

/// Render blocks as a markdown table (text, confidence, position).
pub fn blocks_to_table(blocks: &[OcrBlock]) -> String {
    if blocks.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "| Text | Confidence | Position |".to_string(),
        "|------|------------|----------|".to_string(),
    ];
    for block in blocks {
        let text: String = block.text.chars().take(50).collect();
        let position = block
            .bbox
            .map(|b| format!("({}, {})", b.x1, b.y1))
            .unwrap_or_else(|| "N/A".to_string());
        lines.push(format!(
            "| {} | {:.2}% | {} |",
            text,
            block.confidence * 100.0,
            position
        ));
    }
    lines.join("\n")
}
