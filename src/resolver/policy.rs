//! Turning scored LLM choices into exactly one decision.

use super::llm::{LlmSelection, ToolChoice};
use crate::registry::ToolDefinition;
use std::cmp::Ordering;

const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    Chosen(ToolChoice),
    NoMatch(String),
    Ambiguous(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionPolicy {
    /// Choices scoring below this are ignored.
    pub confidence_threshold: f64,
    /// Choices scoring within this distance of the best one make the query ambiguous.
    pub ambiguity_margin: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            ambiguity_margin: 0.1,
        }
    }
}

impl SelectionPolicy {
    pub fn new(confidence_threshold: f64, ambiguity_margin: f64) -> Self {
        Self {
            confidence_threshold,
            ambiguity_margin,
        }
    }

    pub fn choose(&self, selection: &LlmSelection, candidates: &[ToolDefinition]) -> PolicyOutcome {
        if selection.no_match {
            let reason = selection
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or("the model found no confident match");
            return PolicyOutcome::NoMatch(reason.to_string());
        }

        let mut eligible: Vec<ToolChoice> = Vec::new();
        let mut best_rejected: Option<&ToolChoice> = None;

        for choice in &selection.choices {
            let known = candidates
                .iter()
                .any(|t| t.name == choice.tool_name && t.enabled && !t.is_archived());
            if !known {
                tracing::warn!(tool = %choice.tool_name, "LLM chose a tool that is not a candidate");
                continue;
            }
            if !choice.confidence.is_finite() {
                continue;
            }
            if choice.confidence < self.confidence_threshold {
                if best_rejected.map_or(true, |b| choice.confidence > b.confidence) {
                    best_rejected = Some(choice);
                }
                continue;
            }
            match eligible.iter_mut().find(|c| c.tool_name == choice.tool_name) {
                Some(existing) if existing.confidence < choice.confidence => {
                    *existing = choice.clone();
                }
                Some(_) => {}
                None => eligible.push(choice.clone()),
            }
        }

        eligible.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });

        let Some(top) = eligible.first() else {
            let reason = match (best_rejected, selection.reason.as_deref()) {
                (Some(choice), _) => format!(
                    "best match '{}' scored {:.2}, below the {:.2} threshold",
                    choice.tool_name, choice.confidence, self.confidence_threshold
                ),
                (None, Some(reason)) if !reason.trim().is_empty() => reason.trim().to_string(),
                (None, _) => "the query does not fit any registered tool".to_string(),
            };
            return PolicyOutcome::NoMatch(reason);
        };

        let close: Vec<String> = eligible
            .iter()
            .take_while(|c| top.confidence - c.confidence <= self.ambiguity_margin + SCORE_EPSILON)
            .map(|c| c.tool_name.clone())
            .collect();
        if close.len() > 1 {
            return PolicyOutcome::Ambiguous(close);
        }
        PolicyOutcome::Chosen(top.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServiceConfig, ToolDraft};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn tool(name: &str, enabled: bool) -> ToolDefinition {
        ToolDraft::new(
            name,
            "test tool",
            ServiceConfig {
                service_name: "S".into(),
                service_namespace: None,
                entity_name: "E".into(),
                odata_version: Default::default(),
                http_method: Default::default(),
                default_filters: None,
                default_select: vec![],
                default_expand: vec![],
            },
        )
        .with_enabled(enabled)
        .into_definition(Utc::now())
    }

    fn choice(name: &str, confidence: f64) -> ToolChoice {
        ToolChoice {
            tool_name: name.into(),
            confidence,
            parameters: BTreeMap::new(),
            system_id: None,
        }
    }

    fn selection(choices: Vec<ToolChoice>) -> LlmSelection {
        LlmSelection {
            no_match: false,
            reason: None,
            choices,
        }
    }

    #[test]
    fn test_clear_winner() {
        let tools = vec![tool("a", true), tool("b", true)];
        let out = SelectionPolicy::default()
            .choose(&selection(vec![choice("b", 0.55), choice("a", 0.9)]), &tools);
        assert!(matches!(out, PolicyOutcome::Chosen(c) if c.tool_name == "a"));
    }

    #[test]
    fn test_close_scores_are_ambiguous() {
        let tools = vec![tool("a", true), tool("b", true), tool("c", true)];
        let out = SelectionPolicy::default().choose(
            &selection(vec![choice("a", 0.8), choice("b", 0.7), choice("c", 0.65)]),
            &tools,
        );
        assert_eq!(out, PolicyOutcome::Ambiguous(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_low_confidence_is_no_match() {
        let tools = vec![tool("a", true)];
        let out = SelectionPolicy::default().choose(&selection(vec![choice("a", 0.3)]), &tools);
        assert!(matches!(out, PolicyOutcome::NoMatch(r) if r.contains("'a'")));
    }

    #[test]
    fn test_unknown_and_disabled_choices_are_discarded() {
        let tools = vec![tool("a", true), tool("off", false)];
        let out = SelectionPolicy::default().choose(
            &selection(vec![choice("off", 0.99), choice("ghost", 0.95), choice("a", 0.7)]),
            &tools,
        );
        assert!(matches!(out, PolicyOutcome::Chosen(c) if c.tool_name == "a"));
    }

    #[test]
    fn test_no_match_flag_beats_listed_choices() {
        let mut sel = selection(vec![choice("a", 0.9)]);
        sel.no_match = true;
        assert_eq!(
            SelectionPolicy::default().choose(&sel, &[tool("a", true)]),
            PolicyOutcome::NoMatch("the model found no confident match".into())
        );
    }

    #[test]
    fn test_explicit_no_match_keeps_reason() {
        let sel = LlmSelection {
            no_match: true,
            reason: Some("weather is not SAP data".into()),
            choices: vec![],
        };
        assert_eq!(
            SelectionPolicy::default().choose(&sel, &[tool("a", true)]),
            PolicyOutcome::NoMatch("weather is not SAP data".into())
        );
    }
}
