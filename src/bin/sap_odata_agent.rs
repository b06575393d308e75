//! sap-odata-agent: serve the query/admin API or administer the tool registry.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sap_odata_agent::config::AgentConfig;
use sap_odata_agent::gateway::QueryRequest;
use sap_odata_agent::registry::{
    DeleteMode, RegistryChange, RegistryImport, RegistryManager, ToolStore,
};
use sap_odata_agent::runtime::AgentRuntime;
use sap_odata_agent::{logging, server};
use serde::Serialize;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sap-odata-agent", version)]
#[command(about = "Natural-language queries over SAP OData services", long_about = None)]
struct Cli {
    /// YAML config file (defaults to ./sap-odata-agent.yaml when present)
    #[arg(short, long, env = "SAP_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP query and admin API
    Serve {
        /// Listen address, overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage tool definitions
    Tools {
        #[command(subcommand)]
        command: ToolCommands,
    },

    /// Registry snapshots
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Print the whole registry as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load tool definitions from an export or import file
    Import {
        /// JSON file, or `-` for stdin
        file: PathBuf,

        /// Overwrite tools that already exist
        #[arg(long)]
        replace_existing: bool,
    },

    /// Run one natural-language query
    Query {
        text: String,

        /// SAP system id, overrides the one in the query
        #[arg(long)]
        system: Option<String>,

        /// Follow next links
        #[arg(long)]
        all_pages: bool,
    },
}

#[derive(Subcommand)]
enum ToolCommands {
    /// List tools
    List {
        #[arg(long)]
        enabled_only: bool,
    },

    /// Show one tool
    Get { name: String },

    /// Create a tool from a JSON definition
    Create {
        /// JSON file, or `-` for stdin
        file: PathBuf,
    },

    /// Replace a tool, or merge a partial update with --patch
    Update {
        name: String,

        /// JSON file, or `-` for stdin
        file: PathBuf,

        #[arg(long)]
        patch: bool,

        #[arg(long)]
        expected_version: Option<u64>,
    },

    Enable {
        name: String,
        #[arg(long)]
        expected_version: Option<u64>,
    },

    Disable {
        name: String,
        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Delete a tool (hard by default)
    Delete {
        name: String,

        /// Archive and disable instead of removing
        #[arg(long)]
        soft: bool,

        #[arg(long)]
        expected_version: Option<u64>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List snapshots, newest first
    List,

    /// Replace the registry with a snapshot
    Restore { file: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init(&config.log_level);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
                config.validate()?;
            }
            let runtime = AgentRuntime::builder(config).build().await?;
            server::run(&runtime).await?;
        }
        Commands::Query {
            text,
            system,
            all_pages,
        } => {
            let runtime = AgentRuntime::builder(config)
                .watch_registry(false)
                .build()
                .await?;
            let mut request = QueryRequest::new(text);
            request.system_id = system;
            request.all_pages = all_pages;
            let outcome = runtime.queries().run(request, CancellationToken::new()).await;
            print_json(&outcome)?;
            if !outcome.result.success {
                std::process::exit(1);
            }
        }
        Commands::Tools { command } => {
            let registry = open_registry(&config).await?;
            run_tool_command(&registry, command).await?;
        }
        Commands::Backups { command } => {
            let registry = open_registry(&config).await?;
            match command {
                BackupCommands::List => print_json(&registry.backups().await?)?,
                BackupCommands::Restore { file } => {
                    let version = registry.restore(&file).await?;
                    print_json(&serde_json::json!({ "registry_version": version }))?;
                }
            }
        }
        Commands::Export { output } => {
            let registry = open_registry(&config).await?;
            let text = serde_json::to_string_pretty(&registry.export())?;
            match output {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", text),
            }
        }
        Commands::Import {
            file,
            replace_existing,
        } => {
            let registry = open_registry(&config).await?;
            let value = read_json(&file)?;
            if value.get("tools").is_none() {
                bail!("{} has no 'tools' object", file.display());
            }
            let mut import = import_from_value(value)?;
            import.replace_existing |= replace_existing;
            print_json(&registry.import(import).await?)?;
        }
    }
    Ok(())
}

async fn run_tool_command(registry: &RegistryManager, command: ToolCommands) -> Result<()> {
    match command {
        ToolCommands::List { enabled_only } => print_json(&registry.list(enabled_only))?,
        ToolCommands::Get { name } => print_json(&registry.get(&name)?)?,
        ToolCommands::Create { file } => {
            let draft = registry.parse_draft(read_json(&file)?)?;
            print_json(&registry.apply(RegistryChange::Create(draft)).await?)?;
        }
        ToolCommands::Update {
            name,
            file,
            patch,
            expected_version,
        } => {
            let value = read_json(&file)?;
            let change = if patch {
                RegistryChange::Patch {
                    name,
                    patch: registry.parse_patch(value)?,
                    expected_version,
                }
            } else {
                let draft = registry.parse_draft(value)?;
                if draft.name != name {
                    bail!("definition names '{}' but '{}' was given", draft.name, name);
                }
                RegistryChange::Replace {
                    draft,
                    expected_version,
                }
            };
            print_json(&registry.apply(change).await?)?;
        }
        ToolCommands::Enable {
            name,
            expected_version,
        } => {
            print_json(
                &registry
                    .apply(RegistryChange::SetEnabled {
                        name,
                        enabled: true,
                        expected_version,
                    })
                    .await?,
            )?;
        }
        ToolCommands::Disable {
            name,
            expected_version,
        } => {
            print_json(
                &registry
                    .apply(RegistryChange::SetEnabled {
                        name,
                        enabled: false,
                        expected_version,
                    })
                    .await?,
            )?;
        }
        ToolCommands::Delete {
            name,
            soft,
            expected_version,
        } => {
            let mode = if soft { DeleteMode::Soft } else { DeleteMode::Hard };
            print_json(
                &registry
                    .apply(RegistryChange::Delete {
                        name,
                        mode,
                        expected_version,
                    })
                    .await?,
            )?;
        }
    }
    Ok(())
}

async fn open_registry(config: &AgentConfig) -> Result<RegistryManager> {
    let store = ToolStore::open(
        &config.registry.path,
        config.registry.backup_dir.clone(),
        config.registry.keep_backups,
    )
    .await
    .with_context(|| format!("opening registry {}", config.registry.path.display()))?;
    Ok(RegistryManager::new(Arc::new(store)))
}

/// Accepts both an import file and an export (whose tools carry bookkeeping fields).
fn import_from_value(mut value: Value) -> Result<RegistryImport> {
    if let Some(Value::Object(tools)) = value.get_mut("tools") {
        for tool in tools.values_mut() {
            if let Value::Object(fields) = tool {
                for key in ["version", "created_at", "updated_at", "archived_at"] {
                    fields.remove(key);
                }
            }
        }
    }
    let replace_existing = value
        .get("replace_existing")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let tools = value
        .get("tools")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok(RegistryImport {
        tools: serde_json::from_value(tools).context("parsing tool definitions")?,
        replace_existing,
    })
}

fn read_json(path: &Path) -> Result<Value> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
