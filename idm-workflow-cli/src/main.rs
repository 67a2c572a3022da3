//! Identity workflow CLI
//!
//! Converts and checks lifecycle process definitions, and runs a lifecycle
//! scenario over the in-memory engine.
//!
//! # Usage
//!
//! ```bash
//! # BPMN XML to editor JSON (and back, by extension of the input)
//! idm-workflow convert --file userWorkflow.bpmn20.xml
//!
//! # Structural checks
//! idm-workflow validate --file userWorkflow.json
//!
//! # Tasks reachable from a node
//! idm-workflow next-tasks --file userWorkflow.bpmn20.xml active
//!
//! # create -> suspend -> reactivate -> delete
//! idm-workflow simulate alice --resources ldap,db
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use idm_workflow_core::model::{bpmn_xml, editor_json, ProcessModel};
use idm_workflow_core::{
    resources, FixedActor, IdentityDraft, LifecycleAdapter, MemoryIdentityStore,
    MemoryProcessEngine, WorkflowConfig,
};

#[derive(Parser)]
#[command(name = "idm-workflow")]
#[command(version = "0.1.0")]
#[command(about = "Identity lifecycle workflow tooling")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert BPMN XML to editor JSON, or editor JSON to BPMN XML
    Convert {
        /// Input file; `.json` is read as editor JSON, anything else as BPMN XML
        #[arg(short, long)]
        file: PathBuf,

        /// Output file (stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Report structural problems of a definition
    Validate {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List tasks reachable from a node, passing through gateways
    NextTasks {
        #[arg(short, long)]
        file: PathBuf,

        /// Node id to start from
        from: String,
    },

    /// Run create, suspend, reactivate and delete for one identity
    Simulate {
        username: String,

        #[arg(long, default_value = "password123")]
        password: String,

        /// Comma separated resource keys
        #[arg(long, value_delimiter = ',')]
        resources: Vec<String>,

        /// Acting user
        #[arg(long, env = "IDM_WORKFLOW_ADMIN", default_value = "admin")]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,idm_workflow_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Convert { file, output } => cmd_convert(&file, output.as_deref()),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::NextTasks { file, from } => cmd_next_tasks(&file, &from),
        Commands::Simulate {
            username,
            password,
            resources,
            actor,
        } => cmd_simulate(username, password, resources, actor).await,
    }
}

// =============================================================================
// DEFINITION FILES
// =============================================================================

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn load_model(path: &Path) -> Result<ProcessModel> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if is_json(path) {
        let json: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        editor_json::from_editor_json(&json)
    } else {
        bpmn_xml::parse_process(&text)
    }
}

fn cmd_convert(file: &Path, output: Option<&Path>) -> Result<()> {
    let model = load_model(file)?;
    let rendered = if is_json(file) {
        bpmn_xml::write_definitions(&model)?
    } else {
        serde_json::to_string_pretty(&editor_json::to_editor_json(&model))?
    };
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(process_key = %model.key, output = %path.display(), "Definition converted");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let model = load_model(file)?;
    let issues = model.validate();
    if issues.is_empty() {
        println!("{}: ok ({} nodes, {} flows)", model.key, model.nodes.len(), model.flows.len());
        return Ok(());
    }
    for issue in &issues {
        println!("{}: {}", model.key, issue);
    }
    bail!("{} problem(s) in {}", issues.len(), file.display())
}

fn cmd_next_tasks(file: &Path, from: &str) -> Result<()> {
    let model = load_model(file)?;
    if model.node(from).is_none() {
        bail!("'{}' has no node '{}'", model.key, from);
    }
    let next: Vec<String> = model.next_tasks(from).into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&next)?);
    Ok(())
}

// =============================================================================
// SIMULATION
// =============================================================================

fn print_step<T: Serialize>(step: &str, value: &T) -> Result<()> {
    println!("── {step}");
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_simulate(
    username: String,
    password: String,
    resource_keys: Vec<String>,
    actor: String,
) -> Result<()> {
    let config = WorkflowConfig::from_env()?;
    let adapter = LifecycleAdapter::new(
        Arc::new(MemoryProcessEngine::new()),
        Arc::new(MemoryIdentityStore::new()),
        Arc::new(FixedActor::new(actor)),
        config,
    )?;

    let definitions = adapter.definitions();
    for (key, xml) in resources::bundled() {
        definitions.ensure_deployed(key, xml).await?;
    }
    info!(process_key = %adapter.config().process_key, "Simulating lifecycle");

    let draft = IdentityDraft::new(username)
        .with_password(password)
        .with_resources(resource_keys);
    let created = adapter.create(draft, false, Some(true), true).await?;
    print_step("create", &created)?;
    let key = created.value.0;

    print_step("suspend", &adapter.suspend(key).await?)?;
    print_step("reactivate", &adapter.reactivate(key).await?)?;
    print_step("available", &adapter.available_tasks(key).await?)?;
    print_step("delete", &adapter.delete(key).await?)?;
    Ok(())
}
