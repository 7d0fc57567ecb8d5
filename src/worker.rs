//! Worker-side execution harness (spec §4.4).
//!
//! Everything here runs inside the spawned subprocess: stdio redirection,
//! structured log forwarding, entrypoint lookup, and the invoke/report
//! lifecycle. User code is always caught — a panic or an `ExecutionError`
//! both become a `Fail` IPC message, never an uncaught process abort.

use crate::error::{ExecutionError, Result};
use crate::exec_ctx::{ExecutionContext, JobServiceConfigs};
use crate::ipc::{ExceptionPayload, WorkerMessage};
use crate::log_entry::{LogEntry, LogLevel};
use crate::manifest::{Direction, ModelDecl, PortType};
use crate::port::{Port, PortRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Cap on the serialized size of `exception.data`, in characters (spec §3
/// "MAX_ERR_DATA_LEN", resolved from `original_source/util.py`).
pub const MAX_ERR_DATA_LEN: usize = 10_000;

/// A loaded model callable. Implementors are registered in an
/// [`EntrypointRegistry`] keyed by the manifest's model id (spec §4.4
/// "consulting an optional pre-registered table first").
///
/// Rust has no runtime reflection over compiled symbols, so the "module's
/// public names" fallback named in spec §4.4 does not apply here — the
/// registry lookup is the only resolution path (SPEC_FULL §4.4, recorded
/// in DESIGN.md).
pub trait ModelEntrypoint: Send + Sync {
    fn run(&self, ctx: &ExecutionContext) -> Result<()>;
}

type EntrypointFactory = Arc<dyn Fn() -> Box<dyn ModelEntrypoint> + Send + Sync>;

/// Pre-registered table of model-id → entrypoint factory.
#[derive(Clone, Default)]
pub struct EntrypointRegistry {
    factories: HashMap<String, EntrypointFactory>,
}

impl EntrypointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, model_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ModelEntrypoint> + Send + Sync + 'static,
    {
        self.factories.insert(model_id.into(), Arc::new(factory));
        self
    }

    pub fn resolve(&self, model_id: &str) -> Option<Box<dyn ModelEntrypoint>> {
        self.factories.get(model_id).map(|f| f())
    }
}

/// The job request's relevant fields, as received by the worker (spec §6).
///
/// Also `Serialize` — the supervisor re-serializes the raw request body into
/// a temp file handed to the re-exec'd worker subprocess (spec §4.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobRequest {
    #[serde(rename = "modelId")]
    pub model_id: String,
    #[serde(rename = "logLevel")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub ports: HashMap<String, crate::binding::Binding>,
    #[serde(flatten)]
    pub service_configs: JobServiceConfigs,
}

/// CLI-supplied fallback args relevant to the harness (spec §4.4 log-level
/// resolution: `jobRequest.logLevel ?? args.log_level ?? "INFO"`).
#[derive(Debug, Clone, Default)]
pub struct HarnessArgs {
    pub log_level: Option<String>,
}

fn resolve_log_level(job_request: &JobRequest, args: &HarnessArgs) -> LogLevel {
    job_request
        .log_level
        .as_deref()
        .or(args.log_level.as_deref())
        .and_then(LogLevel::parse)
        .unwrap_or(LogLevel::Info)
}

/// Build the port registry for a job from the model's manifest declarations
/// and the job's supplied bindings (spec §4.4 "Build the Context").
fn build_port_registry(model: &ModelDecl, job_request: &JobRequest) -> PortRegistry {
    let mut registry = PortRegistry::new();
    for decl in &model.ports {
        let binding = job_request.ports.get(&decl.name).cloned();
        registry.insert(Port::build(decl, binding));
    }
    registry
}

/// Assemble the `results` payload for a clean completion (spec §4.4, §8
/// scenario 1; SPEC_FULL §9 resolved open question — stream/multistream
/// output ports whose ids were marked modified participate in `results`
/// alongside document mutations).
pub fn build_results(ctx: &ExecutionContext, model: &ModelDecl) -> HashMap<String, Value> {
    let mut results = HashMap::new();

    for (name, entry) in ctx.modified_documents().snapshot() {
        let mut payload = serde_json::json!({ "document": entry.document });
        if let Some(id) = &entry.document_id {
            payload["documentId"] = Value::String(id.clone());
        }
        if let Some(index) = entry.index {
            payload["index"] = Value::from(index);
        }
        results.insert(name, payload);
    }

    let modified = ctx.modified_streams().snapshot();
    for decl in &model.ports {
        if decl.direction != Direction::Output {
            continue;
        }
        match decl.port_type {
            PortType::Stream => {
                if let Some(Port::Stream(s)) = ctx.port(&decl.name) {
                    if let Some(id) = &s.stream_id {
                        if modified.contains(id) {
                            results.insert(decl.name.clone(), serde_json::json!({ "streamId": id }));
                        }
                    }
                }
            }
            PortType::Multistream => {
                if let Some(Port::Multistream(m)) = ctx.port(&decl.name) {
                    let touched: Vec<&String> = m.stream_ids.iter().filter(|id| modified.contains(*id)).collect();
                    if !touched.is_empty() {
                        results.insert(decl.name.clone(), serde_json::json!({ "streamIds": touched }));
                    }
                }
            }
            _ => {}
        }
    }

    results
}

/// JSON-sanitize an error-data payload, capping its serialized size (spec
/// §4.4 "JSON sanitization of error data", §3 `MAX_ERR_DATA_LEN`).
pub fn sanitize_error_data(data: &Value, cap: usize) -> Value {
    let serialized = data.to_string();
    if serialized.chars().count() <= cap {
        return data.clone();
    }
    let preview: String = serialized.chars().take(150).collect();
    serde_json::json!({
        "error": format!(
            "user data larger than max of {cap} characters. Data preview: {preview}",
        )
    })
}

/// Run one job to completion inside the worker process. Returns the process
/// exit code (spec §6 "Exit codes": 0 clean, non-zero otherwise).
pub async fn run_job(
    registry: &EntrypointRegistry,
    model: &ModelDecl,
    job_request: JobRequest,
    args: HarnessArgs,
    sink: UnboundedSender<WorkerMessage>,
) -> i32 {
    let log_level = resolve_log_level(&job_request, &args);
    let _ = log_level; // consumed by the tracing bridge installed by the caller

    let ports = build_port_registry(model, &job_request);

    let ctx = ExecutionContext::builder(job_request.model_id.clone(), sink.clone())
        .debug(job_request.debug)
        .ports(ports)
        .configs(job_request.service_configs.clone())
        .build();

    // First update marks the job RUNNING on the host (spec §4.4 step 1).
    ctx.update(None, None);

    let Some(entrypoint) = registry.resolve(&job_request.model_id) else {
        let exception = ExecutionError::EntrypointNotFound(job_request.model_id.clone())
            .into_exception(&job_request.model_id);
        emit_log(&sink, LogEntry::new(exception.developer_msg.clone(), LogLevel::Critical));
        let _ = sink.send(WorkerMessage::Fail { exception });
        return 1;
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entrypoint.run(&ctx)));

    match outcome {
        Ok(Ok(())) => {
            let results = build_results(&ctx, model);
            let _ = sink.send(WorkerMessage::Complete { results });
            0
        }
        Ok(Err(err)) => {
            let exception = err.into_exception(&job_request.model_id);
            let sanitized = ExceptionPayload { data: sanitize_error_data(&exception.data, MAX_ERR_DATA_LEN), ..exception };
            emit_log(&sink, LogEntry::new(sanitized.developer_msg.clone(), LogLevel::Critical));
            let _ = sink.send(WorkerMessage::Fail { exception: sanitized });
            1
        }
        Err(panic) => {
            let msg = panic_message(&panic);
            let exception = ExceptionPayload {
                developer_msg: format!("panic in model {:?}: {msg}", job_request.model_id),
                msg,
                data: Value::Null,
                model_id: job_request.model_id.clone(),
            };
            emit_log(&sink, LogEntry::new(exception.developer_msg.clone(), LogLevel::Critical));
            let _ = sink.send(WorkerMessage::Fail { exception });
            1
        }
    }
}

fn emit_log(sink: &UnboundedSender<WorkerMessage>, entry: LogEntry) {
    let _ = sink.send(WorkerMessage::Log { entries: vec![entry] });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "model panicked with a non-string payload".to_string()
    }
}

/// Errors of this shape are what user code raises via the host-defined
/// user-error kind (spec §4.4, grounded on `original_source`'s
/// `SenapsModelError(msg, user_data=None)`).
pub fn user_model_error(msg: impl Into<String>, data: Value) -> ExecutionError {
    ExecutionError::UserModelError { msg: msg.into(), data }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Binding;
    use crate::manifest::{Direction, PortDecl, PortType};

    struct EchoModel;
    impl ModelEntrypoint for EchoModel {
        fn run(&self, ctx: &ExecutionContext) -> Result<()> {
            let input = ctx.port("in").and_then(|p| match p {
                Port::Document(d) => d.get(Some(Value::String(String::new()))),
                _ => None,
            });
            let input = input.and_then(|v| v.as_str().map(|s| s.to_string())).unwrap_or_default();
            if let Some(Port::Document(out)) = ctx.port("out") {
                out.set_document(Value::String(format!("{input}!")), ctx.modified_documents());
            }
            Ok(())
        }
    }

    struct FailingModel;
    impl ModelEntrypoint for FailingModel {
        fn run(&self, _ctx: &ExecutionContext) -> Result<()> {
            Err(ExecutionError::UnhandledWorkerException {
                msg: "something went wrong".to_string(),
                developer_msg: "something went wrong\nat src/worker.rs".to_string(),
            })
        }
    }

    fn echo_model() -> ModelDecl {
        ModelDecl {
            id: "echo".to_string(),
            ports: vec![
                PortDecl { name: "in".to_string(), port_type: PortType::Document, direction: Direction::Input, required: true },
                PortDecl { name: "out".to_string(), port_type: PortType::Document, direction: Direction::Output, required: true },
            ],
        }
    }

    #[tokio::test]
    async fn happy_path_reports_complete_with_results() {
        let registry = EntrypointRegistry::new().register("echo", || Box::new(EchoModel));
        let model = echo_model();
        let mut ports = HashMap::new();
        ports.insert("in".to_string(), Binding::Document { document_id: None, document: Some(Value::String("hello".into())) });
        ports.insert("out".to_string(), Binding::Document { document_id: Some("D1".to_string()), document: Some(Value::String(String::new())) });

        let job_request = JobRequest {
            model_id: "echo".to_string(),
            log_level: None,
            debug: false,
            ports,
            service_configs: JobServiceConfigs::default(),
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let code = run_job(&registry, &model, job_request, HarnessArgs::default(), tx).await;
        assert_eq!(code, 0);

        let mut saw_complete = false;
        while let Ok(msg) = rx.try_recv() {
            if let WorkerMessage::Complete { results } = msg {
                let out = &results["out"];
                assert_eq!(out["document"], Value::String("hello!".into()));
                assert_eq!(out["documentId"], Value::String("D1".into()));
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn user_exception_reports_fail() {
        let registry = EntrypointRegistry::new().register("echo", || Box::new(FailingModel));
        let model = echo_model();
        let job_request = JobRequest {
            model_id: "echo".to_string(),
            log_level: None,
            debug: false,
            ports: HashMap::new(),
            service_configs: JobServiceConfigs::default(),
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let code = run_job(&registry, &model, job_request, HarnessArgs::default(), tx).await;
        assert_eq!(code, 1);

        let mut saw_fail = false;
        while let Ok(msg) = rx.try_recv() {
            if let WorkerMessage::Fail { exception } = msg {
                assert!(exception.developer_msg.contains("something went wrong"));
                assert_eq!(exception.model_id, "echo");
                saw_fail = true;
            }
        }
        assert!(saw_fail);
    }

    #[test]
    fn sanitize_error_data_caps_and_previews_oversized_payload() {
        let huge = Value::String("x".repeat(20_000));
        let sanitized = sanitize_error_data(&huge, MAX_ERR_DATA_LEN);
        let msg = sanitized["error"].as_str().unwrap();
        assert!(msg.contains("larger than max of 10000 characters"));
    }

    #[test]
    fn sanitize_error_data_passes_through_small_payload() {
        let small = serde_json::json!({ "a": 1 });
        assert_eq!(sanitize_error_data(&small, MAX_ERR_DATA_LEN), small);
    }

    #[test]
    fn log_level_resolution_prefers_request_over_args() {
        let job_request = JobRequest {
            model_id: "m".to_string(),
            log_level: Some("DEBUG".to_string()),
            debug: false,
            ports: HashMap::new(),
            service_configs: JobServiceConfigs::default(),
        };
        let args = HarnessArgs { log_level: Some("ERROR".to_string()) };
        assert_eq!(resolve_log_level(&job_request, &args), LogLevel::Debug);
    }

    #[test]
    fn log_level_resolution_falls_back_to_args_then_info() {
        let job_request = JobRequest { model_id: "m".to_string(), log_level: None, debug: false, ports: HashMap::new(), service_configs: JobServiceConfigs::default() };
        let args = HarnessArgs { log_level: Some("WARNING".to_string()) };
        assert_eq!(resolve_log_level(&job_request, &args), LogLevel::Warning);

        let args_empty = HarnessArgs::default();
        assert_eq!(resolve_log_level(&job_request, &args_empty), LogLevel::Info);
    }
}
