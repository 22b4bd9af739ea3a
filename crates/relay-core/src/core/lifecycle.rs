//! Agent session lifecycle.
//!
//! A small state machine that decides whether a usable agent session exists:
//!
//! ```text
//! UNINITIALIZED -> INITIALIZING -> INITIALIZED | NO_PROVIDER | ERROR
//! ```
//!
//! Initialization is single-flight: concurrent callers share one bootstrap.
//! A reset bumps a generation counter so a bootstrap that was already
//! running when the reset happened cannot publish its result afterwards.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, Shared, try_join_all};
use futures_util::FutureExt;
use tokio::sync::watch;

use super::bootstrap::{self, BootstrapFailure, MigrationLedger};
use super::session::Session;
use crate::extension::ExtensionConfig;
use crate::gateway::{
    AgentTransport, ConfigGateway, CostTracker, ExtensionGateway, GatewayError, ResumeRequest,
    StartRequest,
};
use crate::recipe::Recipe;

/// Server config key naming the active provider.
pub const PROVIDER_KEY: &str = "GOOSE_PROVIDER";
/// Server config key naming the active model.
pub const MODEL_KEY: &str = "GOOSE_MODEL";

/// Human-readable progress strings passed to the progress callback.
pub mod progress {
    pub const INITIALIZING: &str = "Agent is initializing";
    pub const LOADING_CONFIG: &str = "Loading configuration";
    pub const EXTENSIONS: &str = "Extensions are loading";
    pub const RESUMING: &str = "Reconnecting to session";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Initialized,
    NoProvider,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Initializing => "initializing",
            AgentState::Initialized => "initialized",
            AgentState::NoProvider => "no_provider",
            AgentState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Start,
    Resume,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitStage::Start => "start",
            InitStage::Resume => "resume",
        })
    }
}

/// Why initialization failed. `Clone` so every waiter of a shared
/// bootstrap receives the same failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Provider or model not configured; route the user to setup.
    NoProviderOrModel,
    AgentStartFailed {
        stage: InitStage,
        source: GatewayError,
    },
    ConfigurationError(BootstrapFailure),
    SystemInitializationFailed {
        extension: Option<String>,
        source: GatewayError,
    },
}

impl InitError {
    /// Context tag for diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            InitError::NoProviderOrModel => "provider",
            InitError::AgentStartFailed {
                stage: InitStage::Start,
                ..
            } => "start",
            InitError::AgentStartFailed {
                stage: InitStage::Resume,
                ..
            } => "resume",
            InitError::ConfigurationError(_) => "config",
            InitError::SystemInitializationFailed { .. } => "extensions",
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::NoProviderOrModel => {
                write!(f, "no provider or model is configured on the agent server")
            }
            InitError::AgentStartFailed { stage, source } => {
                write!(f, "failed to {stage} agent session: {source}")
            }
            InitError::ConfigurationError(failure) => write!(f, "{failure}"),
            InitError::SystemInitializationFailed {
                extension: Some(name),
                source,
            } => write!(f, "failed to load extension '{name}': {source}"),
            InitError::SystemInitializationFailed {
                extension: None,
                source,
            } => write!(f, "failed to list extensions: {source}"),
        }
    }
}

impl std::error::Error for InitError {}

pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// What the caller wants from `initialize`.
#[derive(Clone, Default)]
pub struct InitContext {
    pub recipe: Option<Recipe>,
    pub resume_session_id: Option<String>,
    pub working_dir: Option<PathBuf>,
    progress: Option<ProgressFn>,
}

impl InitContext {
    pub fn new_chat() -> Self {
        Self::default()
    }

    pub fn with_recipe(recipe: Recipe) -> Self {
        Self {
            recipe: Some(recipe),
            ..Self::default()
        }
    }

    pub fn resume(session_id: impl Into<String>) -> Self {
        Self {
            resume_session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    #[must_use]
    pub fn on_progress(mut self, progress: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    fn report(&self, message: &str) {
        if let Some(progress) = &self.progress {
            progress(message);
        }
    }
}

impl fmt::Debug for InitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitContext")
            .field("recipe", &self.recipe.as_ref().map(|r| &r.title))
            .field("resume_session_id", &self.resume_session_id)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

/// Collaborators used by the lifecycle.
#[derive(Clone)]
pub struct LifecycleDeps {
    pub config: Arc<dyn ConfigGateway>,
    pub extensions: Arc<dyn ExtensionGateway>,
    pub transport: Arc<dyn AgentTransport>,
    pub ledger: Arc<dyn MigrationLedger>,
    pub cost: Option<Arc<dyn CostTracker>>,
    /// Working directory for new sessions when the context names none.
    pub working_dir: PathBuf,
}

type InitResult = Result<Session, InitError>;
type SharedInit = Shared<BoxFuture<'static, InitResult>>;

struct Inner {
    generation: u64,
    pending: Option<SharedInit>,
    session_id: Option<String>,
}

pub struct SessionLifecycle {
    deps: LifecycleDeps,
    inner: Mutex<Inner>,
    state: watch::Sender<AgentState>,
}

impl SessionLifecycle {
    pub fn new(deps: LifecycleDeps) -> Arc<Self> {
        let (state, _) = watch::channel(AgentState::Uninitialized);
        Arc::new(Self {
            deps,
            inner: Mutex::new(Inner {
                generation: 0,
                pending: None,
                session_id: None,
            }),
            state,
        })
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Identity of the current session, once initialized.
    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: AgentState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Agent state changed");
        }
    }

    /// Returns a ready session, running the bootstrap at most once for any
    /// number of concurrent callers.
    pub async fn initialize(self: &Arc<Self>, ctx: InitContext) -> InitResult {
        let shared = {
            let mut inner = self.lock();
            if let Some(pending) = &inner.pending {
                pending.clone()
            } else {
                let known = inner.session_id.clone().filter(|id| {
                    self.state() == AgentState::Initialized
                        && ctx.resume_session_id.as_ref().is_none_or(|want| want == id)
                });
                let future = match known {
                    Some(id) => {
                        let generation = inner.generation;
                        Arc::clone(self).reattach(id, ctx, generation).boxed()
                    }
                    None => {
                        if self.state() == AgentState::Initialized {
                            self.reset_locked(&mut inner);
                        }
                        inner.generation += 1;
                        let generation = inner.generation;
                        self.set_state(AgentState::Initializing);
                        Arc::clone(self).bootstrap(ctx, generation).boxed()
                    }
                };
                let shared = future.shared();
                inner.pending = Some(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Forgets the current session and any in-flight bootstrap.
    pub fn reset_initialization(&self) {
        let mut inner = self.lock();
        self.reset_locked(&mut inner);
    }

    fn reset_locked(&self, inner: &mut Inner) {
        inner.generation += 1;
        inner.pending = None;
        inner.session_id = None;
        self.set_state(AgentState::Uninitialized);
    }

    fn finish(&self, generation: u64, result: &InitResult) {
        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::debug!("Discarding result of a superseded initialization");
            return;
        }
        inner.pending = None;
        match result {
            Ok(session) => {
                inner.session_id = Some(session.id.clone());
                self.set_state(AgentState::Initialized);
            }
            Err(InitError::NoProviderOrModel) => {
                inner.session_id = None;
                self.set_state(AgentState::NoProvider);
            }
            Err(err) => {
                tracing::error!(stage = err.stage(), error = %err, "Agent initialization failed");
                inner.session_id = None;
                self.set_state(AgentState::Error);
            }
        }
    }

    async fn bootstrap(self: Arc<Self>, ctx: InitContext, generation: u64) -> InitResult {
        let result = self.run_bootstrap(&ctx).await;
        self.finish(generation, &result);
        result
    }

    async fn reattach(self: Arc<Self>, id: String, ctx: InitContext, generation: u64) -> InitResult {
        ctx.report(progress::RESUMING);
        let result = self
            .deps
            .transport
            .resume(ResumeRequest {
                session_id: id,
                load_model_and_extensions: false,
            })
            .await
            .map(|snapshot| {
                Session::from_snapshot(snapshot, ctx.recipe.clone(), self.working_dir(&ctx))
            })
            .map_err(|source| InitError::AgentStartFailed {
                stage: InitStage::Resume,
                source,
            });
        match &result {
            Ok(_) => self.finish(generation, &result),
            Err(err) => {
                // The session itself is still live; only this lookup failed.
                let mut inner = self.lock();
                if inner.generation == generation {
                    inner.pending = None;
                }
                tracing::warn!(error = %err, "Reattach failed, keeping the current session");
            }
        }
        result
    }

    fn working_dir(&self, ctx: &InitContext) -> PathBuf {
        ctx.working_dir
            .clone()
            .unwrap_or_else(|| self.deps.working_dir.clone())
    }

    async fn run_bootstrap(&self, ctx: &InitContext) -> InitResult {
        ctx.report(progress::INITIALIZING);

        if !self.provider_configured().await {
            return Err(InitError::NoProviderOrModel);
        }

        let working_dir = self.working_dir(ctx);
        let transport = &self.deps.transport;
        let snapshot = match &ctx.resume_session_id {
            Some(id) => transport
                .resume(ResumeRequest {
                    session_id: id.clone(),
                    load_model_and_extensions: true,
                })
                .await
                .map_err(|source| InitError::AgentStartFailed {
                    stage: InitStage::Resume,
                    source,
                })?,
            None => transport
                .start(StartRequest {
                    working_dir: working_dir.clone(),
                    recipe: ctx.recipe.clone(),
                })
                .await
                .map_err(|source| InitError::AgentStartFailed {
                    stage: InitStage::Start,
                    source,
                })?,
        };
        tracing::info!(session_id = %snapshot.session_id, "Agent session ready");

        ctx.report(progress::LOADING_CONFIG);
        let report = bootstrap::run(self.deps.config.as_ref(), self.deps.ledger.as_ref())
            .await
            .map_err(InitError::ConfigurationError)?;
        tracing::debug!(steps = report.steps.len(), "Config bootstrap finished");

        ctx.report(progress::EXTENSIONS);
        let recipe = snapshot.metadata.recipe.as_ref().or(ctx.recipe.as_ref());
        self.attach_extensions(&snapshot.session_id, recipe).await?;

        if let Some(cost) = &self.deps.cost
            && let Err(err) = cost.initialize().await
        {
            tracing::warn!(error = %err, "Cost tracking unavailable");
        }

        Ok(Session::from_snapshot(
            snapshot,
            ctx.recipe.clone(),
            working_dir,
        ))
    }

    async fn provider_configured(&self) -> bool {
        for key in [PROVIDER_KEY, MODEL_KEY] {
            match self.deps.config.read(key).await {
                Ok(Some(value)) if value.as_str().is_some_and(|s| !s.trim().is_empty()) => {}
                Ok(_) => {
                    tracing::info!(key, "Agent configuration incomplete");
                    return false;
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "Could not read agent configuration");
                    return false;
                }
            }
        }
        true
    }

    /// Attaches the recipe's pinned extensions, or the enabled configured set.
    async fn attach_extensions(
        &self,
        session_id: &str,
        recipe: Option<&Recipe>,
    ) -> Result<(), InitError> {
        let configs: Vec<ExtensionConfig> = match recipe.and_then(Recipe::pinned_extensions) {
            Some(pinned) => pinned.to_vec(),
            None => self
                .deps
                .extensions
                .list()
                .await
                .map_err(|source| InitError::SystemInitializationFailed {
                    extension: None,
                    source,
                })?
                .into_iter()
                .filter(|entry| entry.enabled)
                .map(|entry| entry.config)
                .collect(),
        };

        let extensions = &self.deps.extensions;
        try_join_all(configs.iter().map(|config| async move {
            extensions
                .add_to_session(session_id, config)
                .await
                .map_err(|source| InitError::SystemInitializationFailed {
                    extension: Some(config.name.clone()),
                    source,
                })
        }))
        .await?;

        tracing::info!(count = configs.len(), "Extensions attached");
        Ok(())
    }
}
