//! Intent resolution over a live registry, with a scripted and an HTTP-backed LLM.

mod common;

use common::{choice, open_registry, product_search_tool, table_schema_tool, ScriptedLlm};
use mockito::{Matcher, Server};
use sap_odata_agent::config::LlmConfig;
use sap_odata_agent::error_code::ErrorCode;
use sap_odata_agent::registry::{RegistryChange, RegistryManager};
use sap_odata_agent::resolver::{
    ChatCompletionsClient, IntentResolver, LlmSelection, ParamValue, Resolution,
    ResolvedInvocation, SelectionPolicy,
};
use sap_odata_agent::Error;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAKT_QUERY: &str = "Get table schema for MAKT from D2A system";

async fn seeded_registry(dir: &tempfile::TempDir) -> Arc<RegistryManager> {
    let registry = open_registry(dir.path()).await;
    registry
        .apply(RegistryChange::Create(table_schema_tool()))
        .await
        .unwrap();
    registry
        .apply(RegistryChange::Create(product_search_tool()))
        .await
        .unwrap();
    registry
}

fn makt_invocation(system: &str) -> Resolution {
    let mut parameters = BTreeMap::new();
    parameters.insert("table".to_string(), ParamValue::Text("MAKT".to_string()));
    Resolution::Resolved(ResolvedInvocation {
        tool_name: "get_table_schema".to_string(),
        parameters,
        system_id: Some(system.to_string()),
    })
}

#[tokio::test]
async fn test_table_schema_query_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::choosing(vec![
        choice("get_table_schema", 0.93, json!({"table": "MAKT"}), Some("d2a")),
        choice("search_products", 0.12, json!({"text": "MAKT"}), None),
    ]);
    let resolver = IntentResolver::new(llm.clone());

    let resolution = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resolution, makt_invocation("D2A"));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_caller_system_beats_query_system() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::choosing(vec![choice(
        "get_table_schema",
        0.9,
        json!({"table": "MAKT"}),
        Some("D2A"),
    )]);
    let resolver = IntentResolver::new(llm).with_default_system(Some("PRD".to_string()));

    let resolution = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            Some("q01"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resolution, makt_invocation("Q01"));
}

#[tokio::test]
async fn test_default_system_fills_in() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::choosing(vec![choice(
        "get_table_schema",
        0.9,
        json!({"table": "MAKT"}),
        None,
    )]);
    let resolver = IntentResolver::new(llm).with_default_system(Some("PRD".to_string()));

    let resolution = resolver
        .resolve(
            "Show me the fields of MAKT",
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resolution, makt_invocation("PRD"));
}

#[tokio::test]
async fn test_disabled_tool_is_never_offered() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    registry
        .apply(RegistryChange::SetEnabled {
            name: "get_table_schema".into(),
            enabled: false,
            expected_version: None,
        })
        .await
        .unwrap();

    // Even if the model names it anyway, the disabled tool cannot win.
    let llm = ScriptedLlm::choosing(vec![choice(
        "get_table_schema",
        0.99,
        json!({"table": "MAKT"}),
        Some("D2A"),
    )]);
    let resolver = IntentResolver::new(llm.clone());

    let resolution = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(resolution, Resolution::NoMatch { .. }));
    assert_eq!(llm.seen(), vec![vec!["search_products".to_string()]]);
}

#[tokio::test]
async fn test_close_scores_are_ambiguous() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::choosing(vec![
        choice("get_table_schema", 0.8, json!({"table": "MARA"}), None),
        choice("search_products", 0.7, json!({"text": "MARA"}), None),
    ]);
    let resolver = IntentResolver::new(llm);

    let resolution = resolver
        .resolve(
            "MARA",
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match resolution {
        Resolution::AmbiguousIntent { mut candidates } => {
            candidates.sort();
            assert_eq!(candidates, vec!["get_table_schema", "search_products"]);
        }
        other => panic!("expected ambiguity, got {:?}", other),
    }
}

#[tokio::test]
async fn test_low_confidence_is_no_match() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::choosing(vec![choice(
        "search_products",
        0.35,
        json!({"text": "weather"}),
        None,
    )]);
    let resolver = IntentResolver::new(llm).with_policy(SelectionPolicy::new(0.6, 0.1));

    let resolution = resolver
        .resolve(
            "What's the weather in Walldorf?",
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match resolution {
        Resolution::NoMatch { reason } => assert!(reason.contains("search_products"), "{reason}"),
        other => panic!("expected no match, got {:?}", other),
    }
}

#[tokio::test]
async fn test_model_no_match_reason_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::new(LlmSelection {
        no_match: true,
        reason: Some("no tool deals with weather".to_string()),
        choices: vec![],
    });
    let resolver = IntentResolver::new(llm);

    let resolution = resolver
        .resolve(
            "What's the weather in Walldorf?",
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        resolution,
        Resolution::NoMatch {
            reason: "no tool deals with weather".to_string()
        }
    );
}

#[tokio::test]
async fn test_model_no_match_overrides_its_choices() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::new(LlmSelection {
        no_match: true,
        reason: Some("unsure which table is meant".to_string()),
        choices: vec![choice("get_table_schema", 0.9, json!({"table": "MAKT"}), Some("D2A"))],
    });
    let resolver = IntentResolver::new(llm);

    let resolution = resolver
        .resolve(
            "Show me that table",
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        resolution,
        Resolution::NoMatch {
            reason: "unsure which table is meant".to_string()
        }
    );
}

#[tokio::test]
async fn test_bad_parameter_never_reaches_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let llm = ScriptedLlm::choosing(vec![choice(
        "get_table_schema",
        0.95,
        json!({"table": "MAKT' or 1 eq 1"}),
        Some("D2A"),
    )]);
    let resolver = IntentResolver::new(llm);

    let err = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidParameter);
}

#[tokio::test]
async fn test_empty_registry_skips_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(dir.path()).await;
    let llm = ScriptedLlm::choosing(vec![]);
    let resolver = IntentResolver::new(llm.clone());

    let resolution = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(resolution, Resolution::NoMatch { .. }));
    assert_eq!(llm.calls(), 0);
}

fn llm_config(server: &Server) -> LlmConfig {
    LlmConfig {
        endpoint: format!("{}/v1", server.url()),
        api_key: Some("sk-test".to_string()),
        timeout_secs: 5,
        ..LlmConfig::default()
    }
}

#[tokio::test]
async fn test_chat_completions_client_round_trip() {
    let mut server = Server::new_async().await;
    let content = "```json\n{\"no_match\": false, \"choices\": [{\"tool_name\": \"get_table_schema\", \
                   \"confidence\": 0.91, \"parameters\": {\"table\": \"MAKT\"}, \"system_id\": \"D2A\"}]}\n```";
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "response_format": {"type": "json_object"}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let client = ChatCompletionsClient::from_config(&llm_config(&server)).unwrap();
    let resolver = IntentResolver::new(Arc::new(client));

    let resolution = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(resolution, makt_invocation("D2A"));
}

#[tokio::test]
async fn test_chat_completions_failure_is_llm_error() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_body("upstream overloaded")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = seeded_registry(&dir).await;
    let client = ChatCompletionsClient::from_config(&llm_config(&server)).unwrap();
    let resolver = IntentResolver::new(Arc::new(client));

    let err = resolver
        .resolve(
            MAKT_QUERY,
            &registry.resolve_candidates(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert!(matches!(err, Error::Llm { .. }));
    assert_eq!(err.code(), ErrorCode::LlmUnavailable);
}
