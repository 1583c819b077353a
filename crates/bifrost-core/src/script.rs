//! Inline script runtime.
//!
//! Scripts run on an embedded VM with a per-execution engine: print/debug
//! and the `log_*` functions route into the execution's log pipeline as
//! `source = script`, and the top-level scope doubles as the script's main
//! frame, so every surviving binding can be captured as a variable after
//! the run. Evaluation happens on a blocking thread; each log call from
//! the script blocks until its entry is persisted, matching the
//! synchronous write the rest of the pipeline makes. The engine (and with
//! it the logging shim) is dropped when the run ends; nothing global is
//! touched.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rhai::{Dynamic, Scope};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use bifrost_workflow::log::LogLevel;
use bifrost_workflow::WorkflowError;

use crate::capture::{sanitize_dynamic, should_capture};
use crate::context::ExecutionContext;

/// Result body for a script that ran to completion without yielding output.
pub fn silent_success() -> Value {
    json!({"status": "completed", "message": "Script executed successfully"})
}

/// Decode base64-encoded script source.
pub fn decode_source(code: &str) -> Result<String, WorkflowError> {
    let bytes = BASE64
        .decode(code.trim())
        .map_err(|e| WorkflowError::Script(format!("Invalid base64 script payload: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| WorkflowError::Script(format!("Script source is not valid UTF-8: {e}")))
}

/// A syntax problem found at compile time.
pub struct SyntaxError {
    pub line: Option<u32>,
    pub message: String,
}

/// Compile-only syntax check used by validation.
pub fn check_syntax(source: &str) -> Result<(), SyntaxError> {
    let engine = rhai::Engine::new();
    match engine.compile(source) {
        Ok(_) => Ok(()),
        Err(e) => Err(SyntaxError {
            line: e.1.line().map(|l| l as u32),
            message: e.0.to_string(),
        }),
    }
}

/// One log line crossing from the eval thread to the async pipeline. The
/// sender blocks on `ack` until the entry has been persisted.
struct LogRequest {
    level: LogLevel,
    message: String,
    ack: oneshot::Sender<()>,
}

/// Blocking log call made from the VM shims on the eval thread.
fn shim_log(sender: &mpsc::UnboundedSender<LogRequest>, level: LogLevel, message: String) {
    let (ack, done) = oneshot::channel();
    if sender.send(LogRequest { level, message, ack }).is_ok() {
        let _ = done.blocking_recv();
    }
}

/// Execute script source with parameters bound into the scope. Returns the
/// outcome and the captured variables: every non-private, non-callable
/// top-level binding that is not a declared parameter. Variables are
/// captured even when the script fails.
pub async fn execute_script(
    name: &str,
    source: &str,
    ctx: Arc<ExecutionContext>,
    parameters: BTreeMap<String, Value>,
) -> (Result<Value, WorkflowError>, BTreeMap<String, Value>) {
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogRequest>();

    // Forwarder on the runtime: persists each line through the context's
    // pipeline, then releases the waiting eval thread.
    let forwarder_ctx = ctx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(request) = log_rx.recv().await {
            forwarder_ctx.log(request.level, request.message).await;
            let _ = request.ack.send(());
        }
    });

    let eval_name = name.to_string();
    let eval_source = source.to_string();
    let eval_ctx = ctx.clone();
    let eval_tx = log_tx.clone();
    let eval = tokio::task::spawn_blocking(move || {
        run_on_vm(&eval_name, &eval_source, eval_ctx, parameters, eval_tx)
    })
    .await;

    drop(log_tx);
    let _ = forwarder.await;

    match eval {
        Ok(outcome) => outcome,
        Err(e) => (
            Err(WorkflowError::Script(format!("Script task failed: {e}"))),
            BTreeMap::new(),
        ),
    }
}

/// Runs on the blocking thread: build the engine, bind the scope, eval,
/// capture variables.
fn run_on_vm(
    name: &str,
    source: &str,
    ctx: Arc<ExecutionContext>,
    parameters: BTreeMap<String, Value>,
    log_tx: mpsc::UnboundedSender<LogRequest>,
) -> (Result<Value, WorkflowError>, BTreeMap<String, Value>) {
    let mut engine = rhai::Engine::new();

    // Logging shim: library-style logging calls inside the script resolve
    // to this execution's sink, blocking until each line is written.
    let print_tx = log_tx.clone();
    engine.on_print(move |text| shim_log(&print_tx, LogLevel::Info, text.to_string()));
    let debug_tx = log_tx.clone();
    engine.on_debug(move |text, _source, _pos| {
        shim_log(&debug_tx, LogLevel::Debug, text.to_string())
    });
    for (fn_name, level) in [
        ("log_debug", LogLevel::Debug),
        ("log_info", LogLevel::Info),
        ("log_warning", LogLevel::Warning),
        ("log_error", LogLevel::Error),
    ] {
        let fn_tx = log_tx.clone();
        engine.register_fn(fn_name, move |message: rhai::ImmutableString| {
            shim_log(&fn_tx, level, message.to_string());
        });
    }

    // Cooperative cancellation at VM suspension points.
    let cancel_ctx = ctx.clone();
    engine.on_progress(move |_ops| {
        if cancel_ctx.is_cancelled() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let ast = match engine.compile(source) {
        Ok(mut ast) => {
            ast.set_source(format!("<script:{name}>"));
            ast
        }
        Err(e) => {
            return (
                Err(WorkflowError::Script(format!("Script compilation failed: {e}"))),
                BTreeMap::new(),
            );
        }
    };

    let mut scope = Scope::new();
    let declared: HashSet<String> = parameters.keys().cloned().collect();
    for (param_name, value) in &parameters {
        match rhai::serde::to_dynamic(value) {
            Ok(dynamic) => {
                scope.push_dynamic(param_name.clone(), dynamic);
            }
            Err(e) => {
                shim_log(
                    &log_tx,
                    LogLevel::Warning,
                    format!("Parameter '{param_name}' could not be bound: {e}"),
                );
            }
        }
    }
    let context_value = json!({
        "execution_id": ctx.execution_id,
        "user_id": ctx.caller.user_id,
        "email": ctx.caller.email,
        "name": ctx.caller.name,
        "scope": ctx.scope(),
        "is_platform_admin": ctx.is_platform_admin,
    });
    if let Ok(dynamic) = rhai::serde::to_dynamic(&context_value) {
        scope.push_constant_dynamic("context", dynamic);
    }

    let outcome = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);

    let mut variables = BTreeMap::new();
    for (binding_name, is_constant, value) in scope.iter() {
        if is_constant || !should_capture(binding_name, &value, &declared) {
            continue;
        }
        variables.insert(binding_name.to_string(), sanitize_dynamic(&value));
    }

    match outcome {
        Ok(_) => (Ok(silent_success()), variables),
        Err(e) => {
            let message = match *e {
                rhai::EvalAltResult::ErrorTerminated(_, _) => {
                    "Script terminated by cancellation".to_string()
                }
                ref other => format!("Script execution failed: {other}"),
            };
            (Err(WorkflowError::Script(message)), variables)
        }
    }
}
