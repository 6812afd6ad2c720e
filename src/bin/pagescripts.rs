use anyhow::Context;
use clap::{Parser, Subcommand};
use pagescripts::commands::{
    self, Command, IdArgs, LocalScriptArgs, ReorderArgs, SwapArgs, ToggleArgs, UrlArgs,
};
use pagescripts::host::HeadlessPage;
use pagescripts::{Config, ScriptId, ScriptManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pagescripts", version, about = "Userscript manager")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List scripts in order
    List,
    /// Fetch a script from a URL and add it
    Add { url: String },
    /// Add a script from a local file
    AddLocal {
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    Enable { id: String },
    Disable { id: String },
    Delete { id: String },
    /// Re-fetch a remote script
    Refresh { id: String },
    Reorder { id: String, order: i64 },
    /// Exchange the order of two scripts
    Swap { first: String, second: String },
    /// Check that a script parses
    Check { id: String },
    /// Refresh every remote script
    Update,
    /// Load the target page and inject enabled scripts
    Reload,
    /// Auto-update, then open the target page
    Run,
    /// Execute a raw JSON command
    Exec { json: String },
    DataDir,
}

impl CliCommand {
    fn into_command(self) -> anyhow::Result<Command> {
        let id = |raw: String| ScriptId::from(raw);
        Ok(match self {
            CliCommand::List => Command::GetScripts,
            CliCommand::Add { url } => Command::AddScriptFromUrl(UrlArgs { url }),
            CliCommand::AddLocal { file, name } => {
                let code = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                Command::AddLocalScript(LocalScriptArgs { name, code })
            }
            CliCommand::Enable { id: raw } => Command::ToggleScript(ToggleArgs {
                id: id(raw),
                enabled: true,
            }),
            CliCommand::Disable { id: raw } => Command::ToggleScript(ToggleArgs {
                id: id(raw),
                enabled: false,
            }),
            CliCommand::Delete { id: raw } => Command::DeleteScript(IdArgs { id: id(raw) }),
            CliCommand::Refresh { id: raw } => Command::RefreshScript(IdArgs { id: id(raw) }),
            CliCommand::Reorder { id: raw, order } => Command::ReorderScript(ReorderArgs {
                id: id(raw),
                new_order: order,
            }),
            CliCommand::Swap { first, second } => Command::SwapScripts(SwapArgs {
                first: id(first),
                second: id(second),
            }),
            CliCommand::Check { id: raw } => Command::CheckScript(IdArgs { id: id(raw) }),
            CliCommand::Update => Command::AutoUpdateScripts,
            CliCommand::Reload => Command::ReloadScripts,
            CliCommand::DataDir => Command::GetDataDir,
            CliCommand::Run | CliCommand::Exec { .. } => {
                anyhow::bail!("not a single command")
            }
        })
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagescripts=info"));
    let registry = tracing_subscriber::registry().with(filter);

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let _ = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer.compact()).try_init()
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let host = Arc::new(HeadlessPage::new().context("Failed to start page host")?);
    let manager = ScriptManager::with_data_dir(config, host)
        .await
        .context("Failed to open script store")?;

    let output = match cli.command {
        CliCommand::Run => {
            let mut diagnostics = manager.subscribe_diagnostics();
            let changed = manager.startup().await?;
            while let Ok(event) = diagnostics.try_recv() {
                println!("{}", serde_json::to_string(&event)?);
            }
            serde_json::json!({ "changed": changed })
        }
        CliCommand::Exec { json } => commands::execute_json(&manager, &json).await,
        other => {
            let command = other.into_command()?;
            match commands::execute(&manager, command).await {
                Ok(response) => serde_json::to_value(response)?,
                Err(error) => {
                    eprintln!("{}", serde_json::to_string_pretty(&error)?);
                    std::process::exit(1);
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
