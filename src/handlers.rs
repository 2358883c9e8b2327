//! Task handlers and the per-kind dispatch table.
//!
//! A handler turns a [`TaskRequest`] into a [`TaskOutput`]. A check that runs
//! to completion but does not pass yields `Ok` with `success: false`; `Err`
//! is reserved for attempts that could not produce a verdict and are worth
//! retrying.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::baseline::BaselineCache;
use crate::core::task::{TaskError, TaskKind, TaskOutput};
use crate::worker::TaskRequest;

pub type HandlerFuture = BoxFuture<'static, Result<TaskOutput, TaskError>>;

pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, request: TaskRequest) -> HandlerFuture;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
{
    fn handle(&self, request: TaskRequest) -> HandlerFuture {
        self(request).boxed()
    }
}

/// One handler per task kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(TaskKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every kind.
    ///
    /// Visual tasks need a baseline cache; without one they fail with a
    /// `configuration` error.
    pub fn builtin(cache: Option<BaselineCache>) -> Self {
        let mut registry = Self::new();
        registry.register(TaskKind::Visual, move |request: TaskRequest| {
            let cache = cache.clone();
            async move { visual(cache, request).await }
        });
        registry.register(TaskKind::Accessibility, accessibility);
        registry.register(TaskKind::Interaction, interaction);
        registry.register(TaskKind::Performance, performance);
        registry.register(TaskKind::Api, api);
        registry
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: TaskKind, handler: impl TaskHandler) -> &mut Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn supports(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn dispatch(&self, request: TaskRequest) -> HandlerFuture {
        match self.handlers.get(&request.kind) {
            Some(handler) => handler.handle(request),
            None => future::ready(Err(TaskError::execution(
                "unsupported",
                format!("no handler registered for {} tasks", request.kind),
            )))
            .boxed(),
        }
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, TaskError> {
    serde_json::from_value(payload)
        .map_err(|e| TaskError::execution("invalid_payload", e.to_string()))
}

#[derive(Debug, Deserialize)]
struct VisualPayload {
    baseline_id: String,
    baseline_path: PathBuf,
    current_path: PathBuf,
    threshold: Option<f64>,
}

async fn visual(
    cache: Option<BaselineCache>,
    request: TaskRequest,
) -> Result<TaskOutput, TaskError> {
    let Some(cache) = cache else {
        return Err(TaskError::execution(
            "configuration",
            "visual tasks require a baseline cache",
        ));
    };
    let payload: VisualPayload = parse(request.payload)?;

    let current = tokio::fs::read(&payload.current_path).await.map_err(|e| {
        TaskError::execution(
            "io",
            format!("reading {}: {e}", payload.current_path.display()),
        )
    })?;

    let mut options = cache.default_options();
    if let Some(threshold) = payload.threshold {
        options.threshold = threshold;
    }

    let report = cache
        .compare_images(&payload.baseline_id, &payload.baseline_path, current, options)
        .await
        .map_err(|e| TaskError::execution("comparison", e.to_string()))?;

    debug!(
        baseline = %payload.baseline_id,
        difference = report.difference,
        passed = report.passed,
        "Visual check finished"
    );

    let metrics = serde_json::to_value(&report)
        .map_err(|e| TaskError::execution("serialization", e.to_string()))?;
    Ok(TaskOutput::new(TaskKind::Visual, report.passed, metrics))
}

#[derive(Debug, Deserialize)]
struct AccessibilityPayload {
    #[serde(default)]
    violations: Vec<Value>,
    #[serde(default)]
    max_violations: usize,
}

async fn accessibility(request: TaskRequest) -> Result<TaskOutput, TaskError> {
    let payload: AccessibilityPayload = parse(request.payload)?;
    let count = payload.violations.len();
    Ok(TaskOutput::new(
        TaskKind::Accessibility,
        count <= payload.max_violations,
        json!({
            "violations": count,
            "max_violations": payload.max_violations,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct Step {
    name: String,
    passed: bool,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct InteractionPayload {
    steps: Vec<Step>,
}

async fn interaction(request: TaskRequest) -> Result<TaskOutput, TaskError> {
    let payload: InteractionPayload = parse(request.payload)?;
    let failed: Vec<&str> = payload
        .steps
        .iter()
        .filter(|step| !step.passed)
        .map(|step| step.name.as_str())
        .collect();
    let total_ms: u64 = payload.steps.iter().map(|step| step.duration_ms).sum();

    Ok(TaskOutput::new(
        TaskKind::Interaction,
        failed.is_empty(),
        json!({
            "steps": payload.steps.len(),
            "failed_steps": failed,
            "total_duration_ms": total_ms,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct PerformancePayload {
    budgets: HashMap<String, f64>,
    measurements: HashMap<String, f64>,
}

async fn performance(request: TaskRequest) -> Result<TaskOutput, TaskError> {
    let payload: PerformancePayload = parse(request.payload)?;

    let mut over_budget = Vec::new();
    let mut missing = Vec::new();
    for (metric, budget) in &payload.budgets {
        match payload.measurements.get(metric) {
            Some(value) if value > budget => over_budget.push(json!({
                "metric": metric,
                "budget": budget,
                "value": value,
            })),
            Some(_) => {}
            None => missing.push(metric.clone()),
        }
    }
    missing.sort();

    Ok(TaskOutput::new(
        TaskKind::Performance,
        over_budget.is_empty() && missing.is_empty(),
        json!({
            "measurements": payload.measurements,
            "over_budget": over_budget,
            "missing": missing,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ApiPayload {
    expected_status: u16,
    status: u16,
    latency_ms: Option<u64>,
    max_latency_ms: Option<u64>,
}

async fn api(request: TaskRequest) -> Result<TaskOutput, TaskError> {
    let payload: ApiPayload = parse(request.payload)?;
    let status_ok = payload.status == payload.expected_status;
    let latency_ok = match (payload.latency_ms, payload.max_latency_ms) {
        (Some(latency), Some(max)) => latency <= max,
        _ => true,
    };

    Ok(TaskOutput::new(
        TaskKind::Api,
        status_ok && latency_ok,
        json!({
            "status": payload.status,
            "expected_status": payload.expected_status,
            "latency_ms": payload.latency_ms,
        }),
    ))
}
