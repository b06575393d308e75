//! Dispatcher against a mock SAP gateway.

mod common;

use common::{open_registry, product_search_tool, simulate_order_tool, table_schema_tool};
use mockito::{Matcher, Server};
use sap_odata_agent::config::{AuthConfig, SystemConfig};
use sap_odata_agent::dispatch::{ConnectionPool, DispatchOptions, Dispatcher, RetryPolicy};
use sap_odata_agent::error_code::ErrorCode;
use sap_odata_agent::registry::{ParamBinding, RegistryChange, RegistryManager, ToolDraft};
use sap_odata_agent::resolver::{ParamValue, ResolvedInvocation};
use sap_odata_agent::Error;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const TABLE_FIELDS_PATH: &str = "/sap/opu/odata/sap/ZTABLE_SCHEMA_SRV/TableFields";
const PRODUCT_PATH: &str = "/sap/opu/odata4/sap/sap/srvd_a2x/sap/API_PRODUCT/0001/Product";

async fn registry_with(dir: &tempfile::TempDir, drafts: Vec<ToolDraft>) -> Arc<RegistryManager> {
    let registry = open_registry(dir.path()).await;
    for draft in drafts {
        registry.apply(RegistryChange::Create(draft)).await.unwrap();
    }
    registry
}

fn dispatcher(registry: Arc<RegistryManager>, base_url: &str, retry: RetryPolicy) -> Dispatcher {
    let mut systems = BTreeMap::new();
    systems.insert(
        "D2A".to_string(),
        SystemConfig {
            base_url: base_url.to_string(),
            ..SystemConfig::default()
        },
    );
    Dispatcher::new(registry, Arc::new(ConnectionPool::new(systems))).with_retry(retry)
}

fn invocation(tool: &str, params: &[(&str, ParamValue)]) -> ResolvedInvocation {
    ResolvedInvocation {
        tool_name: tool.to_string(),
        parameters: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        system_id: Some("D2A".to_string()),
    }
}

fn text(s: &str) -> ParamValue {
    ParamValue::Text(s.to_string())
}

#[tokio::test]
async fn test_v2_get_normalizes_records() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", TABLE_FIELDS_PATH)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("$filter".into(), "TableName eq 'MAKT'".into()),
            Matcher::UrlEncoded("$format".into(), "json".into()),
        ]))
        .match_header("accept", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"d": {"results": [
                {"FieldName": "MATNR", "DataType": "CHAR"},
                {"FieldName": "MAKTX", "DataType": "CHAR"}
            ]}})
            .to_string(),
        )
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let dispatcher = dispatcher(registry, &server.url(), RetryPolicy::none());

    let result = dispatcher
        .invoke(
            &invocation("get_table_schema", &[("table", text("MAKT"))]),
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await;

    mock.assert_async().await;
    assert!(result.success, "{:?}", result.error);
    let response = result.response.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.record_count, Some(2));
    assert_eq!(response.pages, 1);
    assert_eq!(response.records.unwrap()[1]["FieldName"], "MAKTX");
}

#[tokio::test]
async fn test_sap_error_is_reported_without_retry() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", TABLE_FIELDS_PATH)
        .match_query(Matcher::Any)
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"error": {
                "code": "SY/530",
                "message": {"lang": "en", "value": "Table MAKX is not active"}
            }})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let dispatcher = dispatcher(
        registry,
        &server.url(),
        RetryPolicy {
            max_retries: 3,
            min_delay_ms: 1,
            max_delay_ms: 5,
        },
    );

    let err = dispatcher
        .execute(
            &invocation("get_table_schema", &[("table", text("MAKX"))]),
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    mock.assert_async().await;
    match &err {
        Error::Upstream { status, message, .. } => {
            assert_eq!(*status, 500);
            assert_eq!(message, "[SY/530] Table MAKX is not active");
        }
        other => panic!("unexpected error: {other}"),
    }

    let result = sap_odata_agent::CallResult::from_error(&err);
    assert!(!result.success);
    assert!(result.response.is_none());
    assert_eq!(result.error.as_deref(), Some("[SY/530] Table MAKX is not active"));
}

#[tokio::test]
async fn test_v2_pagination_follows_next_links() {
    let mut server = Server::new_async().await;
    let next = format!("{}{}?$skiptoken=1", server.url(), TABLE_FIELDS_PATH);
    let first = server
        .mock("GET", TABLE_FIELDS_PATH)
        .match_query(Matcher::UrlEncoded("$filter".into(), "TableName eq 'MAKT'".into()))
        .with_status(200)
        .with_body(json!({"d": {"results": [{"FieldName": "MATNR"}], "__next": next}}).to_string())
        .expect(2)
        .create_async()
        .await;
    let second = server
        .mock("GET", TABLE_FIELDS_PATH)
        .match_query(Matcher::UrlEncoded("$skiptoken".into(), "1".into()))
        .with_status(200)
        .with_body(json!({"d": {"results": [{"FieldName": "SPRAS"}]}}).to_string())
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let dispatcher = dispatcher(registry, &server.url(), RetryPolicy::none());
    let call = invocation("get_table_schema", &[("table", text("MAKT"))]);

    // First page only: the next link is surfaced.
    let single = dispatcher
        .execute(&call, &DispatchOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(single.pages, 1);
    assert_eq!(single.record_count, Some(1));
    assert_eq!(single.next_link.as_deref(), Some(next.as_str()));

    let all = dispatcher
        .execute(
            &call,
            &DispatchOptions { all_pages: true },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    first.assert_async().await;
    second.assert_async().await;
    assert_eq!(all.pages, 2);
    assert_eq!(all.record_count, Some(2));
    assert!(all.next_link.is_none());
    let names: Vec<&str> = all
        .records
        .as_ref()
        .unwrap()
        .iter()
        .filter_map(|r| r["FieldName"].as_str())
        .collect();
    assert_eq!(names, vec!["MATNR", "SPRAS"]);
}

#[tokio::test]
async fn test_next_link_to_another_host_is_not_followed() {
    let mut sap = Server::new_async().await;
    let mut collector = Server::new_async().await;
    let foreign = format!("{}{}?$skiptoken=1", collector.url(), TABLE_FIELDS_PATH);
    let page = sap
        .mock("GET", TABLE_FIELDS_PATH)
        .match_query(Matcher::Any)
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
        .with_status(200)
        .with_body(json!({"d": {"results": [{"FieldName": "MATNR"}], "__next": foreign}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let harvested = collector
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let mut systems = BTreeMap::new();
    systems.insert(
        "D2A".to_string(),
        SystemConfig {
            base_url: sap.url(),
            auth: AuthConfig::Basic {
                username: "RFC_USER".into(),
                password: Some("secret".into()),
                password_env: None,
            },
            ..SystemConfig::default()
        },
    );
    let dispatcher = Dispatcher::new(registry, Arc::new(ConnectionPool::new(systems)))
        .with_retry(RetryPolicy::none());

    let result = dispatcher
        .execute(
            &invocation("get_table_schema", &[("table", text("MAKT"))]),
            &DispatchOptions { all_pages: true },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    page.assert_async().await;
    harvested.assert_async().await;
    assert_eq!(result.pages, 1);
    assert_eq!(result.record_count, Some(1));
    assert!(result.next_link.is_none());
}

#[tokio::test]
async fn test_raw_filter_definition_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(dir.path()).await;
    let mut draft = table_schema_tool();
    draft.service_config.default_filters = Some("Company eq '1000'".to_string());
    draft.parameters[0].binding = ParamBinding::Query {
        option: "$filter".to_string(),
    };

    let err = registry
        .apply(RegistryChange::Create(draft))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidDefinition);
    assert_eq!(registry.stats().total_tools, 0);
}

#[tokio::test]
async fn test_v4_filter_literal_is_escaped() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", PRODUCT_PATH)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded(
                "$filter".into(),
                "contains(ProductDescription,'O''Brien')".into(),
            ),
            Matcher::UrlEncoded("$select".into(), "Product,ProductDescription".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({
                "@odata.context": "$metadata#Product",
                "value": [{"Product": "P-100", "ProductDescription": "O'Brien bracket"}]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![product_search_tool()]).await;
    let dispatcher = dispatcher(registry, &server.url(), RetryPolicy::none());

    let response = dispatcher
        .execute(
            &invocation("search_products", &[("text", text("O'Brien"))]),
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(response.record_count, Some(1));
    assert!(response.request_url.contains("O%27%27Brien"));
}

#[tokio::test]
async fn test_post_fetches_csrf_token_first() {
    let mut server = Server::new_async().await;
    let fetch = server
        .mock("GET", "/sap/opu/odata/sap/ZSALES_SIM_SRV")
        .match_header("x-csrf-token", "Fetch")
        .with_status(200)
        .with_header("x-csrf-token", "tok-4711")
        .with_body(json!({"d": {"EntitySets": ["Simulate"]}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let post = server
        .mock("POST", "/sap/opu/odata/sap/ZSALES_SIM_SRV/Simulate")
        .match_header("x-csrf-token", "tok-4711")
        .match_body(Matcher::PartialJson(json!({"Material": "M-01", "Quantity": 5})))
        .with_status(201)
        .with_body(json!({"d": {"Material": "M-01", "NetValue": "125.00"}}).to_string())
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![simulate_order_tool()]).await;
    let dispatcher = dispatcher(registry, &server.url(), RetryPolicy::none());

    let response = dispatcher
        .execute(
            &invocation(
                "simulate_sales_order",
                &[("material", text("M-01")), ("quantity", ParamValue::Integer(5))],
            ),
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    fetch.assert_async().await;
    post.assert_async().await;
    assert_eq!(response.status, 201);
    assert_eq!(response.records.unwrap()[0]["NetValue"], "125.00");
}

#[tokio::test]
async fn test_transport_failure_is_retried_then_reported() {
    // Bind and release a port so nothing listens on it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let dispatcher = dispatcher(
        registry,
        &format!("http://127.0.0.1:{}", port),
        RetryPolicy {
            max_retries: 2,
            min_delay_ms: 1,
            max_delay_ms: 4,
        },
    );

    let err = dispatcher
        .execute(
            &invocation("get_table_schema", &[("table", text("MAKT"))]),
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert_eq!(err.code(), ErrorCode::Transport);
}

#[tokio::test]
async fn test_disabled_tool_is_not_dispatched() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    registry
        .apply(RegistryChange::SetEnabled {
            name: "get_table_schema".into(),
            enabled: false,
            expected_version: None,
        })
        .await
        .unwrap();
    let dispatcher = dispatcher(registry, &server.url(), RetryPolicy::none());

    let err = dispatcher
        .execute(
            &invocation("get_table_schema", &[("table", text("MAKT"))]),
            &DispatchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert!(matches!(err, Error::ToolDisabled { .. }));
}

#[tokio::test]
async fn test_unknown_system_is_a_parameter_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let dispatcher = dispatcher(registry, "http://127.0.0.1:9", RetryPolicy::none());

    let mut call = invocation("get_table_schema", &[("table", text("MAKT"))]);
    call.system_id = Some("Q7X".to_string());
    let err = dispatcher
        .execute(&call, &DispatchOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidParameter);
}

#[tokio::test]
async fn test_cancelled_call_stops_before_sending() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, vec![table_schema_tool()]).await;
    let dispatcher = dispatcher(registry, "http://127.0.0.1:9", RetryPolicy::none());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = dispatcher
        .execute(
            &invocation("get_table_schema", &[("table", text("MAKT"))]),
            &DispatchOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
}
