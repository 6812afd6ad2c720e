//! Command boundary
//!
//! Requests arrive as `{"command": "...", "args": {...}}`. Each command has a
//! fixed argument shape and unknown fields are rejected. Failures come back
//! as an [`ErrorResponse`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::error::{ErrorCode, ErrorResponse, ErrorResponseBuilder};
use crate::injection::InjectionReport;
use crate::manager::{ScriptManager, SyntaxCheck};
use crate::model::{ScriptId, ScriptRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlArgs {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalScriptArgs {
    #[serde(default)]
    pub name: Option<String>,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdArgs {
    pub id: ScriptId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleArgs {
    pub id: ScriptId,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReorderArgs {
    pub id: ScriptId,
    pub new_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwapArgs {
    pub first: ScriptId,
    pub second: ScriptId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    content = "args",
    rename_all = "snake_case",
    deny_unknown_fields
)]
pub enum Command {
    GetScripts,
    AddScriptFromUrl(UrlArgs),
    AddLocalScript(LocalScriptArgs),
    ToggleScript(ToggleArgs),
    DeleteScript(IdArgs),
    RefreshScript(IdArgs),
    ReorderScript(ReorderArgs),
    SwapScripts(SwapArgs),
    CheckScript(IdArgs),
    ReloadScripts,
    AutoUpdateScripts,
    OpenTargetPage,
    CloseTargetPage,
    GetDataDir,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetScripts => "get_scripts",
            Command::AddScriptFromUrl(_) => "add_script_from_url",
            Command::AddLocalScript(_) => "add_local_script",
            Command::ToggleScript(_) => "toggle_script",
            Command::DeleteScript(_) => "delete_script",
            Command::RefreshScript(_) => "refresh_script",
            Command::ReorderScript(_) => "reorder_script",
            Command::SwapScripts(_) => "swap_scripts",
            Command::CheckScript(_) => "check_script",
            Command::ReloadScripts => "reload_scripts",
            Command::AutoUpdateScripts => "auto_update_scripts",
            Command::OpenTargetPage => "open_target_page",
            Command::CloseTargetPage => "close_target_page",
            Command::GetDataDir => "get_data_dir",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok,
    Scripts(Vec<ScriptRecord>),
    Script(ScriptRecord),
    Injection(InjectionReport),
    ChangedCount(usize),
    DataDir(PathBuf),
    SyntaxCheck(SyntaxCheck),
}

pub async fn execute(
    manager: &ScriptManager,
    command: Command,
) -> Result<CommandResponse, ErrorResponse> {
    let name = command.name();
    debug!(command = name, "Executing command");

    let result = match command {
        Command::GetScripts => manager.get_scripts().map(CommandResponse::Scripts),
        Command::AddScriptFromUrl(args) => manager
            .add_script_from_url(&args.url)
            .await
            .map(CommandResponse::Script),
        Command::AddLocalScript(args) => manager
            .add_local_script(args.name, args.code)
            .await
            .map(CommandResponse::Script),
        Command::ToggleScript(args) => manager
            .toggle_script(&args.id, args.enabled)
            .await
            .map(|_| CommandResponse::Ok),
        Command::DeleteScript(args) => manager
            .delete_script(&args.id)
            .await
            .map(|_| CommandResponse::Ok),
        Command::RefreshScript(args) => manager
            .refresh_script(&args.id)
            .await
            .map(CommandResponse::Script),
        Command::ReorderScript(args) => manager
            .reorder_script(&args.id, args.new_order)
            .await
            .map(|_| CommandResponse::Ok),
        Command::SwapScripts(args) => manager
            .swap_scripts(&args.first, &args.second)
            .await
            .map(|_| CommandResponse::Ok),
        Command::CheckScript(args) => manager
            .check_script(&args.id)
            .await
            .map(CommandResponse::SyntaxCheck),
        Command::ReloadScripts => manager
            .reload_scripts()
            .await
            .map(CommandResponse::Injection),
        Command::AutoUpdateScripts => manager
            .auto_update_scripts()
            .await
            .map(CommandResponse::ChangedCount),
        Command::OpenTargetPage => manager
            .open_target_page()
            .await
            .map(|_| CommandResponse::Ok),
        Command::CloseTargetPage => manager
            .close_target_page()
            .await
            .map(|_| CommandResponse::Ok),
        Command::GetDataDir => Ok(CommandResponse::DataDir(manager.get_data_dir().into())),
    };

    result.map_err(|e| e.to_error_response(name))
}

/// Parse a raw request. Unknown commands and malformed arguments become
/// error responses.
pub fn parse_command(raw: &str) -> Result<Command, ErrorResponse> {
    serde_json::from_str(raw).map_err(|e| {
        let message = e.to_string();
        let code = if message.contains("unknown variant") {
            ErrorCode::UnknownCommand
        } else {
            ErrorCode::ValidationError
        };
        ErrorResponseBuilder::new(code, "Invalid command")
            .details(message)
            .command("parse")
            .build()
    })
}

/// Parse, execute and serialize one request.
pub async fn execute_json(manager: &ScriptManager, raw: &str) -> serde_json::Value {
    let outcome = match parse_command(raw) {
        Ok(command) => execute(manager, command).await,
        Err(error) => Err(error),
    };

    let serialized = match &outcome {
        Ok(response) => serde_json::to_value(response),
        Err(error) => serde_json::to_value(error),
    };
    serialized.unwrap_or_else(|e| {
        serde_json::json!({
            "error": { "code": ErrorCode::InternalError, "message": e.to_string() }
        })
    })
}
