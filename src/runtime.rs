use crate::config::AgentConfig;
use crate::dispatch::{ConnectionPool, Dispatcher};
use crate::gateway::QueryService;
use crate::registry::{RegistryManager, RegistryWatcher, ToolStore};
use crate::resolver::{ChatCompletionsClient, IntentResolver, LlmService};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Everything a running agent needs, wired from one [`AgentConfig`].
pub struct AgentRuntime {
    config: AgentConfig,
    registry: Arc<RegistryManager>,
    queries: Arc<QueryService>,
    _watcher: Option<RegistryWatcher>,
}

impl AgentRuntime {
    pub fn builder(config: AgentConfig) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RegistryManager> {
        &self.registry
    }

    pub fn queries(&self) -> &Arc<QueryService> {
        &self.queries
    }
}

/// Builder for [`AgentRuntime`].
///
/// Tests swap in a scripted [`LlmService`] and usually turn the file watcher off.
pub struct AgentRuntimeBuilder {
    config: AgentConfig,
    llm: Option<Arc<dyn LlmService>>,
    watch: Option<bool>,
}

impl AgentRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            llm: None,
            watch: None,
        }
    }

    /// Use this LLM instead of the configured chat completions endpoint.
    pub fn with_llm(mut self, llm: Arc<dyn LlmService>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Overrides `registry.watch`.
    pub fn watch_registry(mut self, enable: bool) -> Self {
        self.watch = Some(enable);
        self
    }

    pub async fn build(self) -> Result<AgentRuntime> {
        let cfg = self.config;

        let store = ToolStore::open(
            &cfg.registry.path,
            cfg.registry.backup_dir.clone(),
            cfg.registry.keep_backups,
        )
        .await?;
        let registry = Arc::new(RegistryManager::new(Arc::new(store)));

        let watcher = if self.watch.unwrap_or(cfg.registry.watch) {
            Some(RegistryWatcher::spawn(registry.clone())?)
        } else {
            None
        };

        let llm: Arc<dyn LlmService> = match self.llm {
            Some(llm) => llm,
            None => Arc::new(ChatCompletionsClient::from_config(&cfg.llm)?),
        };
        let resolver = IntentResolver::new(llm)
            .with_policy(cfg.llm.selection_policy())
            .with_default_system(cfg.default_system.clone());

        let pool = Arc::new(ConnectionPool::new(cfg.systems.clone()));
        let dispatcher = Dispatcher::new(registry.clone(), pool)
            .with_retry(cfg.dispatch.retry_policy())
            .with_max_pages(cfg.dispatch.max_pages)
            .with_default_system(cfg.default_system.clone());

        let queries = Arc::new(QueryService::new(
            registry.clone(),
            resolver,
            dispatcher,
            Duration::from_secs(cfg.dispatch.query_timeout_secs),
        ));

        tracing::info!(
            registry = %cfg.registry.path.display(),
            tools = registry.stats().total_tools,
            systems = cfg.systems.len(),
            watching = watcher.is_some(),
            "Agent runtime ready"
        );

        Ok(AgentRuntime {
            config: cfg,
            registry,
            queries,
            _watcher: watcher,
        })
    }
}
