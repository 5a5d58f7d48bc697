//! The command bus and its middleware pipeline.
//!
//! Commands run through fixed stages, outside-in:
//!
//! 1. **Audit** — generates the command id and writes a preflight row;
//!    finalizes status, duration, and published events afterwards, even
//!    when the transaction rolled back.
//! 2. **Correlation** — ensures the context has a correlation id and
//!    resets it after the command returns.
//! 3. **Transaction** — commands that opt in (`Command::TRANSACTIONAL`)
//!    run inside a store transaction: commit on success, roll back on any
//!    error.
//! 4. **Publish** — resets the unit of work before the handler; drains it
//!    afterwards and routes every event. Integration events are written
//!    to the outbox *inside* the transaction.
//! 5. **Handler dispatch** — the handler registered for the command name.

mod audit;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

pub use audit::{
    redact_parameters, AuditError, AuditSink, AuditStatus, CommandAudit, CommandSource,
    NoopAuditSink,
};

use crate::config::OutboxConfig;
use crate::correlation::CorrelationContext;
use crate::event::{AggregateRoot, DomainEvent, DomainEventDispatcher, EventRouter, NoopDispatcher, UnitOfWork};
use crate::outbox::{AutocommitOutbox, OutboxStore, OutboxWriter};
use crate::{Error, Result};

/// A typed command.
///
/// Commands serialize to JSON so they can travel through durable jobs
/// and re-enter the bus by name.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The handler's return value.
    type Output: Serialize + DeserializeOwned + Send;

    /// Stable command name used for handler lookup and the audit row.
    const NAME: &'static str;

    /// Whether the command runs inside a store transaction.
    const TRANSACTIONAL: bool = false;
}

/// A store transaction opened for one transactional command.
///
/// Dropping the transaction without committing rolls back everything,
/// including outbox writes.
pub trait CommandTxn: OutboxWriter + Send {
    /// Commit the transaction.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Storage seam for the transaction stage.
pub trait CommandStore: Send + Sync + Clone + 'static {
    /// The transaction type this store opens.
    type Txn: CommandTxn;

    /// Open a transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Txn>> + Send;
}

/// What a handler can reach while handling one command.
pub struct CommandScope<S: CommandStore> {
    txn: Option<S::Txn>,
    uow: UnitOfWork,
    correlation: CorrelationContext,
    blog_id: i64,
}

impl<S: CommandStore> CommandScope<S> {
    /// The open transaction for business writes.
    ///
    /// Fails with [`Error::IncorrectUsage`] when the command did not opt
    /// into the transaction stage.
    pub fn txn(&mut self) -> Result<&mut S::Txn> {
        self.txn.as_mut().ok_or_else(|| {
            Error::IncorrectUsage(
                "command is not transactional; set `const TRANSACTIONAL: bool = true`".into(),
            )
        })
    }

    /// The correlation context of this command.
    pub fn correlation(&mut self) -> &mut CorrelationContext {
        &mut self.correlation
    }

    /// Queue a domain event for the publish stage.
    pub fn record(&mut self, event: Arc<dyn DomainEvent>) {
        self.uow.record(event);
    }

    /// Drain the events an aggregate recorded.
    pub fn collect_from(&mut self, aggregate: &mut dyn AggregateRoot) {
        self.uow.collect_from(aggregate);
    }

    /// Tenant scope of the dispatch.
    pub fn blog_id(&self) -> i64 {
        self.blog_id
    }
}

/// Handler for one command type.
#[async_trait]
pub trait CommandHandler<S: CommandStore>: Send + Sync + 'static {
    /// The command this handler accepts.
    type Command: Command;

    /// Handle the command.
    async fn handle(
        &self,
        command: Self::Command,
        scope: &mut CommandScope<S>,
    ) -> Result<<Self::Command as Command>::Output>;
}

/// Type-erased handler entry for dynamic dispatch by command name.
#[async_trait]
trait ErasedHandler<S: CommandStore>: Send + Sync {
    async fn call(&self, payload: Value, scope: &mut CommandScope<S>) -> Result<Value>;
}

struct HandlerAdapter<H>(H);

#[async_trait]
impl<S, H> ErasedHandler<S> for HandlerAdapter<H>
where
    S: CommandStore,
    H: CommandHandler<S>,
{
    async fn call(&self, payload: Value, scope: &mut CommandScope<S>) -> Result<Value> {
        let command: H::Command = serde_json::from_value(payload)?;
        let output = self.0.handle(command, scope).await?;
        Ok(serde_json::to_value(output)?)
    }
}

struct HandlerEntry<S: CommandStore> {
    transactional: bool,
    handler: Box<dyn ErasedHandler<S>>,
}

/// Per-dispatch options: issuer, correlation to join, tenant.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Who issued the command.
    pub source: CommandSource,
    /// Identifier of the issuer.
    pub source_id: Option<String>,
    /// Correlation to join; a fresh id is generated when absent.
    pub correlation_id: Option<Uuid>,
    /// Tenant scope.
    pub blog_id: i64,
}

/// Builder for a [`CommandBus`].
pub struct CommandBusBuilder<S>
where
    S: CommandStore + OutboxStore,
{
    store: S,
    dispatcher: Arc<dyn DomainEventDispatcher>,
    audit: Arc<dyn AuditSink>,
    config: OutboxConfig,
    environment: String,
    handlers: HashMap<&'static str, HandlerEntry<S>>,
    duplicate: Option<&'static str>,
}

impl<S> CommandBusBuilder<S>
where
    S: CommandStore + OutboxStore,
{
    /// Register a handler. The command name is the key; each name
    /// registers once (checked at build time).
    pub fn register<H>(mut self, handler: H) -> Self
    where
        H: CommandHandler<S>,
    {
        let name = H::Command::NAME;
        if self.handlers.contains_key(name) {
            if self.duplicate.is_none() {
                self.duplicate = Some(name);
            }
            return self;
        }
        self.handlers.insert(
            name,
            HandlerEntry {
                transactional: H::Command::TRANSACTIONAL,
                handler: Box::new(HandlerAdapter(handler)),
            },
        );
        self
    }

    /// Set the local domain-event dispatcher.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn DomainEventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the audit sink.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Set the outbox configuration used for written entries.
    pub fn outbox_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the environment label stamped on audit rows.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Validate and build the bus.
    pub fn build(self) -> Result<CommandBus<S>> {
        if let Some(name) = self.duplicate {
            return Err(Error::DuplicateRegistration(format!("command '{name}'")));
        }
        let router = EventRouter::new(self.dispatcher, self.config.clone());
        Ok(CommandBus {
            store: self.store,
            handlers: self.handlers,
            audit: self.audit,
            router,
            environment: self.environment,
        })
    }
}

/// Dispatches commands through the middleware pipeline.
pub struct CommandBus<S>
where
    S: CommandStore + OutboxStore,
{
    store: S,
    handlers: HashMap<&'static str, HandlerEntry<S>>,
    audit: Arc<dyn AuditSink>,
    router: EventRouter,
    environment: String,
}

impl<S> CommandBus<S>
where
    S: CommandStore + OutboxStore,
{
    /// Start building a bus over the given store.
    pub fn builder(store: S) -> CommandBusBuilder<S> {
        CommandBusBuilder {
            store,
            dispatcher: Arc::new(NoopDispatcher),
            audit: Arc::new(NoopAuditSink),
            config: OutboxConfig::default(),
            environment: "production".to_owned(),
            handlers: HashMap::new(),
            duplicate: None,
        }
    }

    /// Dispatch a typed command with default options.
    pub async fn dispatch<C: Command>(&self, command: C) -> Result<C::Output> {
        self.dispatch_with(command, DispatchOptions::default()).await
    }

    /// Dispatch a typed command.
    pub async fn dispatch_with<C: Command>(
        &self,
        command: C,
        options: DispatchOptions,
    ) -> Result<C::Output> {
        let payload = serde_json::to_value(&command)?;
        let output = self.execute(C::NAME, payload, options).await?;
        Ok(serde_json::from_value(output)?)
    }

    /// Dispatch by name with a JSON payload — the durable-job entry
    /// point. The payload must deserialize into the registered command.
    pub async fn dispatch_dynamic(
        &self,
        name: &str,
        payload: Value,
        options: DispatchOptions,
    ) -> Result<Value> {
        self.execute(name, payload, options).await
    }

    async fn execute(
        &self,
        name: &str,
        payload: Value,
        options: DispatchOptions,
    ) -> Result<Value> {
        let entry = self
            .handlers
            .get(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_owned()))?;

        // Audit is outermost so the command id exists before correlation
        // is touched and the final row is written even on rollback.
        let command_id = Uuid::new_v4();
        let mut correlation = CorrelationContext::init(options.correlation_id);
        correlation.set_command_id(command_id);
        let correlation_id = correlation.get();

        let mut audit = CommandAudit::start(
            command_id,
            correlation_id,
            name,
            options.source,
            options.source_id,
            payload.clone(),
            &self.environment,
            options.blog_id,
        );
        if let Err(error) = self.audit.begin(&audit).await {
            warn!(command = name, error = %error, "Audit preflight write failed");
        }

        debug!(command = name, command_id = %command_id, correlation_id = %correlation_id, "Dispatching command");

        let outcome = self
            .run_stages(entry, payload, correlation, options.blog_id)
            .await;

        match &outcome {
            Ok((_, events)) => {
                audit.finish(AuditStatus::Success, events.clone(), None);
            }
            Err(error) => {
                audit.finish(
                    AuditStatus::Error,
                    Vec::new(),
                    Some(AuditError {
                        kind: error_kind(error).to_owned(),
                        message: error.to_string(),
                        code: None,
                    }),
                );
            }
        }
        if let Err(error) = self.audit.complete(&audit).await {
            warn!(command = name, error = %error, "Audit completion write failed");
        }

        outcome.map(|(output, _)| output)
    }

    /// Transaction, publish, and handler stages. The correlation context
    /// lives and dies inside this call, so state never leaks across
    /// commands.
    async fn run_stages(
        &self,
        entry: &HandlerEntry<S>,
        payload: Value,
        correlation: CorrelationContext,
        blog_id: i64,
    ) -> Result<(Value, Vec<String>)> {
        let txn = if entry.transactional {
            Some(self.store.begin().await?)
        } else {
            None
        };

        let mut scope = CommandScope {
            txn,
            uow: UnitOfWork::new(),
            correlation,
            blog_id,
        };

        let output = match entry.handler.call(payload, &mut scope).await {
            Ok(output) => output,
            Err(error) => {
                // Dropping the transaction rolls everything back.
                drop(scope.txn.take());
                return Err(error);
            }
        };

        let events = scope.uow.drain();
        let route_result = self
            .route_events(&events, &mut scope.txn, &mut scope.correlation, blog_id)
            .await;
        if let Err(error) = route_result {
            drop(scope.txn.take());
            return Err(error);
        }

        if let Some(txn) = scope.txn.take() {
            txn.commit().await?;
        }

        Ok((output, scope.uow.published_names()))
    }

    async fn route_events(
        &self,
        events: &[Arc<dyn DomainEvent>],
        txn: &mut Option<S::Txn>,
        correlation: &mut CorrelationContext,
        blog_id: i64,
    ) -> Result<()> {
        for event in events {
            match txn.as_mut() {
                Some(txn) => {
                    self.router
                        .publish(event.as_ref(), txn, correlation, blog_id)
                        .await?;
                }
                None => {
                    let mut writer = AutocommitOutbox::new(&self.store);
                    self.router
                        .publish(event.as_ref(), &mut writer, correlation, blog_id)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::BusinessConstraint(_) => "business_constraint",
        Error::Invariant(_) => "invariant",
        Error::RefNotFound { .. } => "ref_not_found",
        Error::IncorrectUsage(_) => "incorrect_usage",
        Error::Serialization(_) => "serialization",
        #[cfg(feature = "postgres")]
        Error::Query(_) => "query",
        Error::LockUnavailable { .. } => "locking",
        Error::StepFailed { .. } => "step_failed",
        Error::CompensationFailed { .. } => "compensation_failed",
        Error::ExternalPublish(_) => "external_publish",
        Error::Publish(_) => "publish",
        Error::UnknownProcessType(_) | Error::UnknownBehaviour(_) | Error::UnknownCommand(_) => {
            "incorrect_usage"
        }
        Error::DuplicateRegistration(_) => "incorrect_usage",
    }
}
