//! Capability-binding sandbox.
//!
//! Generated steps are Rhai scripts. The engine exposes exactly two kinds of
//! values to them: the backend's named bindings (callable with up to
//! [`MAX_BINDING_ARGS`] arguments) and a mutable `shared` object map that the
//! session carries from one step to the next. Nothing else from the host is
//! reachable, and runaway scripts are cut off by an operation budget.

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use uipilot_driver::{Binding, CapabilityCatalog};

/// Name of the shared-state variable visible to scripts
pub const SHARED_STATE_VAR: &str = "shared";

/// Highest arity a binding can be called with from a script
pub const MAX_BINDING_ARGS: usize = 4;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("script failed to compile: {0}")]
    Compile(String),
    #[error("{0}")]
    Runtime(String),
    #[error("value conversion failed: {0}")]
    Conversion(String),
    #[error("sandbox task failed: {0}")]
    Join(String),
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: Value,
    pub shared_state: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 32,
        }
    }
}

#[derive(Clone)]
pub struct Sandbox {
    bindings: Vec<(String, Binding)>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(bindings: Vec<(String, Binding)>) -> Self {
        Self {
            bindings,
            limits: SandboxLimits::default(),
        }
    }

    /// Sandbox exposing every binding of a capability catalog
    pub fn from_catalog(catalog: &CapabilityCatalog) -> Self {
        Self::new(catalog.bindings())
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn binding_names(&self) -> Vec<&str> {
        self.bindings.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Evaluate a script on a blocking thread.
    ///
    /// Bindings may block on async backend calls, so evaluation never runs on
    /// the async executor itself.
    pub async fn evaluate(
        &self,
        code: &str,
        shared_state: &Map<String, Value>,
    ) -> Result<Evaluation, SandboxError> {
        let sandbox = self.clone();
        let code = code.to_string();
        let state = shared_state.clone();
        tokio::task::spawn_blocking(move || sandbox.evaluate_blocking(&code, state))
            .await
            .map_err(|e| SandboxError::Join(e.to_string()))?
    }

    /// Evaluate a script on the current thread.
    pub fn evaluate_blocking(
        &self,
        code: &str,
        shared_state: Map<String, Value>,
    ) -> Result<Evaluation, SandboxError> {
        let engine = self.build_engine();
        let ast = engine
            .compile(code)
            .map_err(|e| SandboxError::Compile(e.to_string()))?;

        let mut scope = Scope::new();
        let shared = to_dynamic(Value::Object(shared_state))
            .map_err(|e| SandboxError::Conversion(e.to_string()))?;
        scope.push(SHARED_STATE_VAR, shared);

        let result: Dynamic = engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;

        let result: Value =
            from_dynamic(&result).map_err(|e| SandboxError::Conversion(e.to_string()))?;

        let shared = scope
            .get_value::<Dynamic>(SHARED_STATE_VAR)
            .unwrap_or_else(|| Dynamic::from_map(rhai::Map::new()));
        let shared_state = match from_dynamic::<Value>(&shared) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(SandboxError::Conversion(format!(
                    "`{}` must remain an object map, got {}",
                    SHARED_STATE_VAR, other
                )))
            }
            Err(e) => return Err(SandboxError::Conversion(e.to_string())),
        };

        debug!("Script evaluated to {}", result);
        Ok(Evaluation {
            result,
            shared_state,
        })
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.disable_symbol("eval");
        engine.on_print(|text| info!(target: "uipilot::script", "{}", text));
        engine.on_debug(|text, _source, pos| debug!(target: "uipilot::script", "{} @ {}", text, pos));

        for (name, binding) in &self.bindings {
            register_binding(&mut engine, name, binding);
        }
        engine
    }
}

/// Register `name` for every arity from zero to [`MAX_BINDING_ARGS`]
fn register_binding(engine: &mut Engine, name: &str, binding: &Binding) {
    let b = binding.clone();
    engine.register_fn(name, move || invoke(&b, Vec::new()));
    let b = binding.clone();
    engine.register_fn(name, move |a: Dynamic| invoke(&b, vec![a]));
    let b = binding.clone();
    engine.register_fn(name, move |a: Dynamic, b2: Dynamic| invoke(&b, vec![a, b2]));
    let b = binding.clone();
    engine.register_fn(name, move |a: Dynamic, b2: Dynamic, c: Dynamic| {
        invoke(&b, vec![a, b2, c])
    });
    let b = binding.clone();
    engine.register_fn(
        name,
        move |a: Dynamic, b2: Dynamic, c: Dynamic, d: Dynamic| invoke(&b, vec![a, b2, c, d]),
    );
}

fn invoke(binding: &Binding, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
    let args = args
        .iter()
        .map(|arg| from_dynamic::<Value>(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let value = binding(args).map_err(|e| -> Box<EvalAltResult> { format!("{:#}", e).into() })?;
    to_dynamic(value)
}
