use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use thiserror::Error;

use super::ReferenceLoader;
use super::page::{self, ScriptPage};
use super::system::{self, Host, Scorer, System, finite_number, to_number};
use crate::browser::PageHandle;
use crate::task::{CheckPointResult, Mode, Task};

/// Name of the function a grading script must define
pub const ENTRY_POINT: &str = "main";

// Extra time granted to the script thread to notice the deadline on its own
const DEADLINE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("grading script does not compile: {0}")]
    Compile(String),
    #[error("grading script failed: {0}")]
    Runtime(String),
    #[error("grading script exceeded its {0:?} time limit")]
    Timeout(Duration),
    #[error("grading script exceeded a sandbox limit: {0}")]
    Limit(String),
    #[error("script thread panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    pub script_timeout: Duration,
    pub image_cap: usize,
    pub max_operations: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_secs(10),
            image_cap: 5 * 1024 * 1024,
            max_operations: 50_000_000,
        }
    }
}

/// Executes grading scripts inside a restricted Rhai engine.
#[derive(Clone)]
pub struct ScriptRuntime {
    limits: RuntimeLimits,
    references: Arc<dyn ReferenceLoader>,
}

impl ScriptRuntime {
    pub fn new(limits: RuntimeLimits, references: Arc<dyn ReferenceLoader>) -> Self {
        Self { limits, references }
    }

    /// Runs `task.judge_script` against `page` and returns one result per checkpoint
    pub async fn run(
        &self,
        task: &Task,
        page: Arc<dyn PageHandle>,
    ) -> Result<Vec<CheckPointResult>, ScriptError> {
        let limits = self.limits;
        let deadline = Instant::now() + limits.script_timeout;
        let host = HostSpec {
            handle: tokio::runtime::Handle::current(),
            deadline,
            page,
            references: Arc::clone(&self.references),
            mode: task.mode,
            info: task.info.clone().unwrap_or_default(),
        };
        let script = task.judge_script.clone();
        let record_id = task.judge_record_id;

        let job = tokio::task::spawn_blocking(move || execute(record_id, &script, host, limits));

        match tokio::time::timeout(limits.script_timeout + DEADLINE_GRACE, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ScriptError::Panicked(e.to_string())),
            Err(_) => Err(ScriptError::Timeout(limits.script_timeout)),
        }
    }
}

/// Thread-safe inputs for building the script-side [`Host`]
struct HostSpec {
    handle: tokio::runtime::Handle,
    deadline: Instant,
    page: Arc<dyn PageHandle>,
    references: Arc<dyn ReferenceLoader>,
    mode: Mode,
    info: std::collections::HashMap<String, String>,
}

fn build_engine(record_id: i64, deadline: Instant, limits: &RuntimeLimits) -> Engine {
    let mut engine = Engine::new();

    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(128, 64);
    engine.set_max_string_size(1 << 20);
    engine.set_max_array_size(1 << 24);
    engine.set_max_map_size(1 << 14);

    engine.on_progress(move |_| {
        if Instant::now() >= deadline {
            Some("deadline".into())
        } else {
            None
        }
    });
    engine.on_print(move |s| log::debug!("[record {record_id}] {s}"));
    engine.on_debug(move |s, _, pos| log::debug!("[record {record_id}] {pos:?} {s}"));

    system::register(&mut engine);
    page::register(&mut engine);
    engine
}

fn root_cause(error: &EvalAltResult) -> &EvalAltResult {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => root_cause(inner),
        other => other,
    }
}

/// Errors that end the whole run rather than a single checkpoint
fn fatal(error: &EvalAltResult, deadline: Instant, limits: &RuntimeLimits) -> Option<ScriptError> {
    match root_cause(error) {
        EvalAltResult::ErrorTerminated(..) => Some(ScriptError::Timeout(limits.script_timeout)),
        EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)
        | EvalAltResult::ErrorDataTooLarge(..) => Some(ScriptError::Limit(error.to_string())),
        _ if Instant::now() >= deadline => Some(ScriptError::Timeout(limits.script_timeout)),
        _ => None,
    }
}

fn execute(
    record_id: i64,
    script: &str,
    spec: HostSpec,
    limits: RuntimeLimits,
) -> Result<Vec<CheckPointResult>, ScriptError> {
    let deadline = spec.deadline;
    let engine = build_engine(record_id, deadline, &limits);
    let ast = engine
        .compile(script)
        .map_err(|e| ScriptError::Compile(e.to_string()))?;

    let host = Rc::new(Host {
        handle: spec.handle,
        deadline,
        page: spec.page,
        references: spec.references,
        image_cap: limits.image_cap,
        mode: spec.mode,
        info: spec.info,
    });
    let system = System::new(Rc::clone(&host));
    let page = ScriptPage::new(host);

    let mut scope = Scope::new();
    let _: Dynamic = engine
        .call_fn(&mut scope, &ast, ENTRY_POINT, (system.clone(), page))
        .map_err(|e| {
            fatal(&e, deadline, &limits).unwrap_or_else(|| ScriptError::Runtime(e.to_string()))
        })?;

    let checkpoints = system.take_checkpoints();
    log::debug!("Record {record_id} registered {} checkpoints", checkpoints.len());

    let mut results = Vec::with_capacity(checkpoints.len());
    for checkpoint in checkpoints {
        let scorer = Scorer::default();
        system.begin_checkpoint();
        let outcome = checkpoint
            .handler
            .call::<Dynamic>(&engine, &ast, (scorer.clone(),));
        let files = system.end_checkpoint();

        let failure = match outcome {
            Ok(returned) if to_number(&returned).is_some() => {
                match finite_number(&returned, "returned score") {
                    Ok(score) => {
                        scorer.set_value(score);
                        None
                    }
                    Err(message) => Some(message),
                }
            }
            Ok(_) => None,
            Err(e) => {
                if let Some(fatal) = fatal(&e, deadline, &limits) {
                    return Err(fatal);
                }
                Some(e.to_string())
            }
        };

        let result = match failure {
            None => {
                let score = scorer.get();
                let details = if score == checkpoint.total_score {
                    String::new()
                } else {
                    format!("scored {score} of {}", checkpoint.total_score)
                };
                CheckPointResult::new(checkpoint.name, score, checkpoint.total_score, details, files)
            }
            Some(message) => {
                log::debug!("Record {record_id} checkpoint {:?} failed: {message}", checkpoint.name);
                CheckPointResult::failed(
                    checkpoint.name,
                    scorer.get(),
                    checkpoint.total_score,
                    message,
                    files,
                )
            }
        };
        results.push(result);
    }

    Ok(results)
}
