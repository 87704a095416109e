//! Automatic engine selection.
//!
//! A pure decision function: request hints map to an engine id without
//! consulting the registry. An unavailable choice is resolved downstream by
//! the factory's fallback chain.

use serde::{Deserialize, Serialize};

use crate::engine::{GUTENOCR_3B, GUTENOCR_7B, MISTRAL_OCR, PADDLEOCR, TESSERACT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Cost,
    Speed,
    Accuracy,
    #[default]
    Balanced,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cost" => Some(Self::Cost),
            "speed" => Some(Self::Speed),
            "accuracy" => Some(Self::Accuracy),
            "balanced" => Some(Self::Balanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Fixed cheap-first order backing the `cost` priority; every member is a
/// zero-cost engine.
const CHEAP_FIRST: &[&str] = &[TESSERACT, PADDLEOCR];

const MANUSCRIPT_TYPES: &[&str] = &["manuscript", "manuscrit", "handwriting"];
const STRUCTURED_TYPES: &[&str] =
    &["invoice", "facture", "form", "formulaire", "structured", "table"];

/// Pick an engine for the given hints. First matching rule wins within a
/// priority branch.
pub fn auto_select(
    priority: Priority,
    document_type: Option<&str>,
    complexity: Complexity,
    has_gpu: bool,
) -> &'static str {
    match priority {
        Priority::Cost => CHEAP_FIRST[0],

        Priority::Speed => match complexity {
            Complexity::Low => TESSERACT,
            _ => GUTENOCR_3B,
        },

        Priority::Accuracy => {
            let document_type = document_type.map(|d| d.to_ascii_lowercase());
            if let Some(document_type) = document_type.as_deref() {
                if MANUSCRIPT_TYPES.contains(&document_type) {
                    return if has_gpu { GUTENOCR_7B } else { GUTENOCR_3B };
                }
                if STRUCTURED_TYPES.contains(&document_type) {
                    return MISTRAL_OCR;
                }
            }
            if has_gpu {
                GUTENOCR_7B
            } else {
                GUTENOCR_3B
            }
        }

        Priority::Balanced => match complexity {
            Complexity::High => {
                if has_gpu {
                    GUTENOCR_7B
                } else {
                    MISTRAL_OCR
                }
            }
            Complexity::Medium => GUTENOCR_3B,
            Complexity::Low => PADDLEOCR,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_deterministic() {
        let first = auto_select(Priority::Balanced, Some("report"), Complexity::High, true);
        let second = auto_select(Priority::Balanced, Some("report"), Complexity::High, true);
        assert_eq!(first, second);
    }

    #[test]
    fn cost_priority_never_picks_a_paid_engine() {
        for document_type in [None, Some("invoice"), Some("manuscript")] {
            for complexity in [Complexity::Low, Complexity::Medium, Complexity::High] {
                for has_gpu in [false, true] {
                    let choice = auto_select(Priority::Cost, document_type, complexity, has_gpu);
                    assert_eq!(choice, TESSERACT);
                    assert_ne!(choice, MISTRAL_OCR);
                }
            }
        }
    }

    #[test]
    fn speed_scales_with_complexity() {
        assert_eq!(auto_select(Priority::Speed, None, Complexity::Low, false), TESSERACT);
        assert_eq!(auto_select(Priority::Speed, None, Complexity::Medium, false), GUTENOCR_3B);
        assert_eq!(auto_select(Priority::Speed, None, Complexity::High, true), GUTENOCR_3B);
    }

    #[test]
    fn accuracy_routes_manuscripts_to_vlm() {
        assert_eq!(
            auto_select(Priority::Accuracy, Some("manuscript"), Complexity::Medium, true),
            GUTENOCR_7B
        );
        assert_eq!(
            auto_select(Priority::Accuracy, Some("handwriting"), Complexity::Medium, false),
            GUTENOCR_3B
        );
    }

    #[test]
    fn accuracy_routes_structured_documents_to_api() {
        for document_type in ["invoice", "Facture", "form", "table"] {
            assert_eq!(
                auto_select(Priority::Accuracy, Some(document_type), Complexity::Medium, false),
                MISTRAL_OCR
            );
        }
    }

    #[test]
    fn accuracy_default_follows_gpu() {
        assert_eq!(auto_select(Priority::Accuracy, None, Complexity::Medium, true), GUTENOCR_7B);
        assert_eq!(
            auto_select(Priority::Accuracy, Some("letter"), Complexity::Medium, false),
            GUTENOCR_3B
        );
    }

    #[test]
    fn balanced_branches_on_complexity() {
        assert_eq!(auto_select(Priority::Balanced, None, Complexity::High, true), GUTENOCR_7B);
        assert_eq!(auto_select(Priority::Balanced, None, Complexity::High, false), MISTRAL_OCR);
        assert_eq!(auto_select(Priority::Balanced, None, Complexity::Medium, false), GUTENOCR_3B);
        assert_eq!(auto_select(Priority::Balanced, None, Complexity::Low, false), PADDLEOCR);
    }

    #[test]
    fn hint_parsing() {
        assert_eq!(Priority::parse("accuracy"), Some(Priority::Accuracy));
        assert_eq!(Priority::parse("fast"), None);
        assert_eq!(Complexity::parse("high"), Some(Complexity::High));
        assert_eq!(Complexity::parse(""), None);
    }
}
