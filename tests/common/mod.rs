//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use sap_odata_agent::registry::{
    FilterOperator, HttpMethod, ODataVersion, ParamBinding, ParamKind, ParameterSpec,
    RegistryManager, ServiceConfig, ToolDraft, ToolStore,
};
use sap_odata_agent::resolver::{LlmSelection, LlmService, SelectionRequest, ToolChoice};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// LLM stand-in that always gives the same answer and records what it was shown.
pub struct ScriptedLlm {
    answer: LlmSelection,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new(answer: LlmSelection) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn choosing(choices: Vec<ToolChoice>) -> Arc<Self> {
        Self::new(LlmSelection {
            no_match: false,
            reason: None,
            choices,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Candidate names of every request received.
    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn select(&self, request: &SelectionRequest) -> sap_odata_agent::Result<LlmSelection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(request.candidates.iter().map(|c| c.name.clone()).collect());
        Ok(self.answer.clone())
    }
}

pub fn choice(tool: &str, confidence: f64, parameters: Value, system: Option<&str>) -> ToolChoice {
    let parameters: BTreeMap<String, Value> = serde_json::from_value(parameters).unwrap();
    ToolChoice {
        tool_name: tool.to_string(),
        confidence,
        parameters,
        system_id: system.map(str::to_string),
    }
}

pub fn service(name: &str, entity: &str, version: ODataVersion, method: HttpMethod) -> ServiceConfig {
    ServiceConfig {
        service_name: name.to_string(),
        service_namespace: None,
        entity_name: entity.to_string(),
        odata_version: version,
        http_method: method,
        default_filters: None,
        default_select: vec![],
        default_expand: vec![],
    }
}

/// v2 GET tool returning the DDIC fields of a table.
pub fn table_schema_tool() -> ToolDraft {
    ToolDraft::new(
        "get_table_schema",
        "Returns the field list (DDIC schema) of an SAP table",
        service("ZTABLE_SCHEMA_SRV", "TableFields", ODataVersion::V2, HttpMethod::Get),
    )
    .with_parameter(ParameterSpec {
        name: "table".to_string(),
        description: "SAP table name, e.g. MAKT".to_string(),
        kind: ParamKind::String,
        required: true,
        pattern: Some("[A-Z0-9_/]{1,30}".to_string()),
        binding: ParamBinding::Filter {
            field: "TableName".to_string(),
            operator: FilterOperator::Eq,
        },
    })
}

/// v4 GET tool searching products by description.
pub fn product_search_tool() -> ToolDraft {
    let mut draft = ToolDraft::new(
        "search_products",
        "Finds products by description",
        service("API_PRODUCT", "Product", ODataVersion::V4, HttpMethod::Get),
    )
    .with_parameter(ParameterSpec {
        name: "text".to_string(),
        description: "Part of the product description".to_string(),
        kind: ParamKind::String,
        required: true,
        pattern: None,
        binding: ParamBinding::Filter {
            field: "ProductDescription".to_string(),
            operator: FilterOperator::Contains,
        },
    });
    draft.service_config.service_namespace = Some("sap".to_string());
    draft.service_config.default_select = vec!["Product".to_string(), "ProductDescription".to_string()];
    draft
}

/// v2 POST tool simulating a sales order.
pub fn simulate_order_tool() -> ToolDraft {
    ToolDraft::new(
        "simulate_sales_order",
        "Simulates pricing of a sales order for one material",
        service("ZSALES_SIM_SRV", "Simulate", ODataVersion::V2, HttpMethod::Post),
    )
    .with_parameter(ParameterSpec {
        name: "material".to_string(),
        description: "Material number".to_string(),
        kind: ParamKind::String,
        required: true,
        pattern: None,
        binding: ParamBinding::Body {
            field: "Material".to_string(),
        },
    })
    .with_parameter(ParameterSpec {
        name: "quantity".to_string(),
        description: "Order quantity".to_string(),
        kind: ParamKind::Integer,
        required: true,
        pattern: None,
        binding: ParamBinding::Body {
            field: "Quantity".to_string(),
        },
    })
}

pub async fn open_registry(dir: &Path) -> Arc<RegistryManager> {
    let store = ToolStore::open(dir.join("tool_registry.json"), None, 10)
        .await
        .expect("open registry");
    Arc::new(RegistryManager::new(Arc::new(store)))
}
