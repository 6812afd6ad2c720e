//! Syntax pre-flight for script bodies
//!
//! Compiles source with `new Function(source)` in a throwaway QuickJS
//! context. Nothing in the body runs. Results are advisory only.

use rquickjs::{Coerced, Context, Ctx, Runtime};
use tracing::warn;

use crate::model::ScriptId;

/// Compiles script bodies without running them. Not `Send`; create one per
/// blocking task.
pub struct SyntaxChecker {
    context: Context,
    _runtime: Runtime,
}

impl SyntaxChecker {
    pub fn new() -> Result<Self, String> {
        let runtime = Runtime::new().map_err(|e| format!("runtime new: {}", e))?;
        let context = Context::full(&runtime).map_err(|e| format!("context create: {}", e))?;
        Ok(Self {
            context,
            _runtime: runtime,
        })
    }

    /// `Ok` if `code` parses as a function body, otherwise the parser message
    pub fn check(&self, code: &str) -> Result<(), String> {
        self.context.with(|ctx| {
            let global = ctx.globals();
            global
                .set("__source", code)
                .map_err(|e| format!("Failed to stage source: {}", e))?;
            let result = ctx
                .eval::<(), _>("new Function(__source); undefined")
                .map_err(|e| exception_message(&ctx, e));
            let _ = global.remove("__source");
            result
        })
    }
}

/// Check a single body off the async runtime
pub async fn check_source(code: String) -> Result<(), String> {
    tokio::task::spawn_blocking(move || SyntaxChecker::new()?.check(&code))
        .await
        .map_err(|e| format!("Syntax check task failed: {}", e))?
}

/// Check many bodies with one checker. Returns the ones that failed.
pub async fn find_syntax_errors(sources: Vec<(ScriptId, String)>) -> Vec<(ScriptId, String)> {
    let result = tokio::task::spawn_blocking(move || {
        let checker = SyntaxChecker::new()?;
        Ok::<_, String>(
            sources
                .into_iter()
                .filter_map(|(id, code)| {
                    checker.check(&code).err().map(|message| (id, message))
                })
                .collect::<Vec<_>>(),
        )
    })
    .await;

    match result {
        Ok(Ok(failures)) => failures,
        Ok(Err(e)) => {
            warn!("Syntax pre-flight unavailable: {}", e);
            Vec::new()
        }
        Err(e) => {
            warn!("Syntax pre-flight task failed: {}", e);
            Vec::new()
        }
    }
}

/// Human-readable message for an error raised while evaluating in `ctx`
pub(crate) fn exception_message(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }

    let value = ctx.catch();
    if let Some(exception) = value.as_exception() {
        let message = exception
            .message()
            .unwrap_or_else(|| "Uncaught exception".to_string());
        return match value
            .as_object()
            .and_then(|object| object.get::<_, Coerced<String>>("name").ok())
        {
            Some(name) if !name.0.is_empty() && name.0 != "Error" => {
                format!("{}: {}", name.0, message)
            }
            _ => message,
        };
    }

    value
        .get::<Coerced<String>>()
        .map(|text| format!("Uncaught {}", text.0))
        .unwrap_or_else(|_| "Uncaught exception".to_string())
}
