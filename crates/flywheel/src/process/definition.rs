//! Explicit step registration for process types.
//!
//! Each process type declares its steps on a builder at startup; the
//! resulting [`ProcessDefinition`] owns the executable closures and the
//! frozen schema ([`ProcessSteps`]) snapshotted into new instances.
//! Event handlers are not steps — a step that needs the resuming event
//! reads it from [`StepContext::event`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use nonempty::NonEmpty;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::ProcessSteps;
use crate::event::EventEnvelope;
use crate::{Error, Result};

/// A request to suspend the process until an integration event arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct AwaitEvent {
    /// The domain event name to wait for.
    pub event_type: String,
    /// Fields the event must match with strict equality.
    pub match_criteria: Map<String, Value>,
}

impl AwaitEvent {
    /// Wait for any event of the given type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            match_criteria: Map::new(),
        }
    }

    /// Require a field of the event to equal `value`.
    pub fn with_criterion(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.match_criteria.insert(field.into(), value.into());
        self
    }
}

/// A fire-and-forget command a step asks to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    /// The command name, resolved by the command bus.
    pub name: String,
    /// The command payload.
    pub payload: Value,
}

/// What a step (or compensation) hands back to the runner.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub(crate) payload: Option<Value>,
    pub(crate) commands: Vec<CommandEnvelope>,
    pub(crate) await_event: Option<AwaitEvent>,
    pub(crate) checkpoint: Option<Value>,
}

impl StepOutcome {
    /// An outcome with no payload, commands, or suspension.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass a typed payload to the next step (persisted on suspend).
    pub fn with_payload(mut self, payload: impl Serialize) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Persist opaque data for this step's compensation.
    pub fn with_checkpoint(mut self, checkpoint: impl Serialize) -> Result<Self> {
        self.checkpoint = Some(serde_json::to_value(checkpoint)?);
        Ok(self)
    }

    /// Dispatch a fire-and-forget command.
    pub fn with_command(mut self, name: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        self.commands.push(CommandEnvelope {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
        });
        Ok(self)
    }

    /// Suspend until a matching integration event arrives.
    pub fn suspend_until(mut self, await_event: AwaitEvent) -> Self {
        self.await_event = Some(await_event);
        self
    }
}

/// Everything a step closure can see.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The process's constructor arguments.
    pub data: Value,
    /// The payload handed over by the previous step.
    pub payload: Option<Value>,
    /// The event that resumed the process — set only for the step
    /// immediately after an await.
    pub event: Option<EventEnvelope>,
    /// For compensations: the checkpoint the forward step recorded.
    pub checkpoint: Option<Value>,
    /// For compensations: the message of the failure being unwound.
    pub cause: Option<String>,
    /// Correlation id of the process.
    pub correlation_id: Uuid,
}

impl StepContext {
    /// Deserialize the business data.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Deserialize the previous step's payload.
    ///
    /// Fails with [`Error::IncorrectUsage`] when no payload was handed
    /// over.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload.clone().ok_or_else(|| {
            Error::IncorrectUsage("step expected a payload from the previous step".into())
        })?;
        Ok(serde_json::from_value(payload)?)
    }
}

type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send>>;
type StepFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

pub(crate) struct StepDef {
    pub(crate) name: String,
    pub(crate) run: StepFn,
    pub(crate) is_async: bool,
}

pub(crate) struct CompensationDef {
    pub(crate) name: String,
    pub(crate) run: StepFn,
    pub(crate) is_async: bool,
}

/// The executable definition of one process type.
///
/// Built once at startup and registered in a [`ProcessRegistry`]. The
/// persisted schema of running instances is matched against this
/// definition by step *name*; steps missing from the definition fail
/// with [`Error::IncorrectUsage`] rather than silently skipping.
pub struct ProcessDefinition {
    process_type: &'static str,
    steps: NonEmpty<StepDef>,
    compensations: BTreeMap<String, CompensationDef>,
}

impl std::fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("process_type", &self.process_type)
            .field("steps", &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("compensations", &self.compensations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessDefinition {
    /// Start declaring a process type.
    pub fn builder(process_type: &'static str) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder {
            process_type,
            steps: Vec::new(),
            compensations: BTreeMap::new(),
        }
    }

    /// The process type discriminator.
    pub fn process_type(&self) -> &'static str {
        self.process_type
    }

    /// The frozen schema snapshotted into new instances.
    pub fn snapshot(&self) -> ProcessSteps {
        let steps = self.steps.iter().map(|s| s.name.clone()).collect();
        let compensations = self
            .compensations
            .iter()
            .map(|(step, comp)| (step.clone(), comp.name.clone()))
            .collect();
        ProcessSteps::new(steps, compensations)
    }

    pub(crate) fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub(crate) fn compensation(&self, forward_step: &str) -> Option<&CompensationDef> {
        self.compensations.get(forward_step)
    }
}

/// Builder collecting the steps and compensations of a process type.
pub struct ProcessDefinitionBuilder {
    process_type: &'static str,
    steps: Vec<StepDef>,
    compensations: BTreeMap<String, CompensationDef>,
}

impl ProcessDefinitionBuilder {
    /// Declare the next forward step.
    pub fn step<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.push_step(name.into(), f, false)
    }

    /// Declare the next forward step, marked async: the runner reschedules
    /// onto a queue worker before executing it.
    pub fn async_step<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.push_step(name.into(), f, true)
    }

    /// Declare the compensation for a forward step.
    pub fn compensation<F, Fut>(
        self,
        for_step: impl Into<String>,
        name: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.push_compensation(for_step.into(), name.into(), f, false)
    }

    /// Declare an async-marked compensation for a forward step.
    pub fn async_compensation<F, Fut>(
        self,
        for_step: impl Into<String>,
        name: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.push_compensation(for_step.into(), name.into(), f, true)
    }

    fn push_step<F, Fut>(mut self, name: String, f: F, is_async: bool) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.steps.push(StepDef {
            name,
            run: Arc::new(move |ctx| Box::pin(f(ctx))),
            is_async,
        });
        self
    }

    fn push_compensation<F, Fut>(
        mut self,
        for_step: String,
        name: String,
        f: F,
        is_async: bool,
    ) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.compensations.insert(
            for_step,
            CompensationDef {
                name,
                run: Arc::new(move |ctx| Box::pin(f(ctx))),
                is_async,
            },
        );
        self
    }

    /// Validate and freeze the definition.
    ///
    /// Fails when no steps were declared, a step name repeats, or a
    /// compensation targets an unknown step.
    pub fn build(self) -> Result<ProcessDefinition> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(Error::DuplicateRegistration(format!(
                    "step '{}' on process '{}'",
                    step.name, self.process_type
                )));
            }
        }
        for for_step in self.compensations.keys() {
            if !seen.contains(for_step.as_str()) {
                return Err(Error::IncorrectUsage(format!(
                    "compensation targets unknown step '{for_step}' on process '{}'",
                    self.process_type
                )));
            }
        }

        let steps = NonEmpty::from_vec(self.steps).ok_or_else(|| {
            Error::IncorrectUsage(format!(
                "process '{}' must declare at least one step",
                self.process_type
            ))
        })?;

        Ok(ProcessDefinition {
            process_type: self.process_type,
            steps,
            compensations: self.compensations,
        })
    }
}

/// Registry mapping process types to their definitions.
#[derive(Default)]
pub struct ProcessRegistry {
    definitions: HashMap<&'static str, Arc<ProcessDefinition>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Each process type registers once.
    pub fn register(&mut self, definition: ProcessDefinition) -> Result<()> {
        let key = definition.process_type();
        if self.definitions.contains_key(key) {
            return Err(Error::DuplicateRegistration(format!("process '{key}'")));
        }
        self.definitions.insert(key, Arc::new(definition));
        Ok(())
    }

    /// Look up a definition by process type.
    pub fn get(&self, process_type: &str) -> Result<Arc<ProcessDefinition>> {
        self.definitions
            .get(process_type)
            .cloned()
            .ok_or_else(|| Error::UnknownProcessType(process_type.to_owned()))
    }

    /// Number of registered process types.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_step(_ctx: StepContext) -> impl Future<Output = Result<StepOutcome>> {
        async { Ok(StepOutcome::new()) }
    }

    #[test]
    fn snapshot_freezes_names_and_compensations() {
        let definition = ProcessDefinition::builder("order_fulfilment")
            .step("charge", ok_step)
            .step("ship", ok_step)
            .compensation("charge", "refund_charge", ok_step)
            .build()
            .unwrap();

        let snapshot = definition.snapshot();
        assert_eq!(snapshot.total_steps(), 2);
        assert_eq!(snapshot.current_step(), Some("charge"));
        assert_eq!(snapshot.compensation_for("charge"), Some("refund_charge"));
        assert_eq!(snapshot.compensation_for("ship"), None);
    }

    #[test]
    fn empty_definition_is_rejected() {
        let err = ProcessDefinition::builder("empty").build().unwrap_err();
        assert!(matches!(err, Error::IncorrectUsage(_)));
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let err = ProcessDefinition::builder("dupe")
            .step("a", ok_step)
            .step("a", ok_step)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(_)));
    }

    #[test]
    fn compensation_for_unknown_step_is_rejected() {
        let err = ProcessDefinition::builder("orphan")
            .step("a", ok_step)
            .compensation("b", "undo_b", ok_step)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::IncorrectUsage(_)));
    }

    #[test]
    fn registry_rejects_duplicates_and_unknown_lookups() {
        let mut registry = ProcessRegistry::new();
        registry
            .register(
                ProcessDefinition::builder("p")
                    .step("a", ok_step)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let err = registry
            .register(
                ProcessDefinition::builder("p")
                    .step("a", ok_step)
                    .build()
                    .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(_)));

        assert!(registry.get("p").is_ok());
        assert!(matches!(
            registry.get("q").unwrap_err(),
            Error::UnknownProcessType(_)
        ));
    }
}
