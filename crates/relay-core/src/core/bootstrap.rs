//! Configuration bootstrap cascade.
//!
//! Brings the server's configuration store to a readable state. Each failed
//! rung drops to the next broader action instead of retrying:
//!
//! 1. load: init the store and read it strictly
//! 2. migrate: if the read failed and the local config version is stale,
//!    back up and reset the store
//! 3. validate, then recover on failure
//! 4. reinitialize from scratch (the floor)
//!
//! The cascade therefore terminates after a bounded number of actions.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;

use crate::config::LocalState;
use crate::gateway::{ConfigGateway, ConfigSnapshot, GatewayError, ReadMode};

/// Config schema version this client expects. Stores last bootstrapped under
/// an older version are migrated when they fail to load.
pub const CURRENT_CONFIG_VERSION: u32 = 3;

/// Local record of the config schema version last bootstrapped.
pub trait MigrationLedger: Send + Sync {
    fn config_version(&self) -> Result<Option<u32>>;
    fn record_config_version(&self, version: u32) -> Result<()>;
}

/// Ledger persisted in `${RELAY_HOME}/state.toml`.
#[derive(Debug, Clone)]
pub struct FileMigrationLedger {
    path: PathBuf,
}

impl FileMigrationLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MigrationLedger for FileMigrationLedger {
    fn config_version(&self) -> Result<Option<u32>> {
        Ok(LocalState::load_from(&self.path)?.config_version)
    }

    fn record_config_version(&self, version: u32) -> Result<()> {
        let mut state = LocalState::load_from(&self.path).unwrap_or_default();
        if state.config_version == Some(version) {
            return Ok(());
        }
        state.config_version = Some(version);
        state.save_to(&self.path)
    }
}

#[derive(Debug, Default)]
pub struct MemoryMigrationLedger {
    version: Mutex<Option<u32>>,
}

impl MemoryMigrationLedger {
    pub fn with_version(version: Option<u32>) -> Self {
        Self {
            version: Mutex::new(version),
        }
    }
}

impl MigrationLedger for MemoryMigrationLedger {
    fn config_version(&self) -> Result<Option<u32>> {
        Ok(*self
            .version
            .lock()
            .map_err(|_| anyhow::anyhow!("migration ledger poisoned"))?)
    }

    fn record_config_version(&self, version: u32) -> Result<()> {
        *self
            .version
            .lock()
            .map_err(|_| anyhow::anyhow!("migration ledger poisoned"))? = Some(version);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    Load,
    Migrate,
    Validate,
    Recover,
    Reinitialize,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootstrapStep::Load => "load",
            BootstrapStep::Migrate => "migrate",
            BootstrapStep::Validate => "validate",
            BootstrapStep::Recover => "recover",
            BootstrapStep::Reinitialize => "reinitialize",
        })
    }
}

/// One executed rung and, if it failed, why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: BootstrapStep,
    pub error: Option<GatewayError>,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub snapshot: ConfigSnapshot,
    pub steps: Vec<StepRecord>,
}

impl BootstrapReport {
    pub fn ran(&self, step: BootstrapStep) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }
}

/// Every rung failed, including the reinitialize floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFailure {
    pub steps: Vec<StepRecord>,
}

impl BootstrapFailure {
    /// Error of the last rung that ran.
    pub fn last_error(&self) -> Option<&GatewayError> {
        self.steps.iter().rev().find_map(|s| s.error.as_ref())
    }
}

impl fmt::Display for BootstrapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trail = self
            .steps
            .iter()
            .map(|s| s.step.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        match self.last_error() {
            Some(err) => write!(f, "configuration unusable after {trail}: {err}"),
            None => write!(f, "configuration unusable after {trail}"),
        }
    }
}

impl std::error::Error for BootstrapFailure {}

struct Trace {
    steps: Vec<StepRecord>,
}

impl Trace {
    fn record<T>(&mut self, step: BootstrapStep, result: &Result<T, GatewayError>) {
        let error = result.as_ref().err().cloned();
        match &error {
            Some(err) => tracing::warn!(%step, error = %err, "Config bootstrap step failed"),
            None => tracing::debug!(%step, "Config bootstrap step succeeded"),
        }
        self.steps.push(StepRecord { step, error });
    }
}

/// Runs the cascade against `config`, consulting and updating `ledger`.
pub async fn run(
    config: &dyn ConfigGateway,
    ledger: &dyn MigrationLedger,
) -> Result<BootstrapReport, BootstrapFailure> {
    let mut trace = Trace { steps: Vec::new() };

    let loaded = load(config).await;
    trace.record(BootstrapStep::Load, &loaded);

    let mut snapshot = loaded.ok();
    if snapshot.is_none() && migration_owed(ledger) {
        let migrated = migrate(config).await;
        trace.record(BootstrapStep::Migrate, &migrated);
        if migrated.is_err() {
            return reinitialize(config, ledger, trace).await;
        }
    }

    let validated = config.validate().await;
    trace.record(BootstrapStep::Validate, &validated);
    if validated.is_err() {
        snapshot = None;
        let recovered = config.recover().await;
        trace.record(BootstrapStep::Recover, &recovered);
        if recovered.is_err() {
            return reinitialize(config, ledger, trace).await;
        }
    }

    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => match config.read_all(ReadMode::Lenient).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "Config unreadable after repair");
                return reinitialize(config, ledger, trace).await;
            }
        },
    };

    mark_current(ledger);
    Ok(BootstrapReport {
        snapshot,
        steps: trace.steps,
    })
}

async fn load(config: &dyn ConfigGateway) -> Result<ConfigSnapshot, GatewayError> {
    config.init().await?;
    config.read_all(ReadMode::Strict).await
}

async fn migrate(config: &dyn ConfigGateway) -> Result<(), GatewayError> {
    config.backup().await?;
    config.reset().await
}

fn migration_owed(ledger: &dyn MigrationLedger) -> bool {
    match ledger.config_version() {
        Ok(version) => version.is_none_or(|v| v < CURRENT_CONFIG_VERSION),
        Err(err) => {
            tracing::warn!(error = %err, "Could not read local config version; assuming stale");
            true
        }
    }
}

fn mark_current(ledger: &dyn MigrationLedger) {
    if let Err(err) = ledger.record_config_version(CURRENT_CONFIG_VERSION) {
        tracing::warn!(error = %err, "Failed to record local config version");
    }
}

/// The floor: back up whatever exists, reset, and read leniently.
async fn reinitialize(
    config: &dyn ConfigGateway,
    ledger: &dyn MigrationLedger,
    mut trace: Trace,
) -> Result<BootstrapReport, BootstrapFailure> {
    if let Err(err) = config.backup().await {
        tracing::warn!(error = %err, "Config backup before reinitialize failed");
    }

    let result = async {
        config.reset().await?;
        config.init().await?;
        config.read_all(ReadMode::Lenient).await
    }
    .await;
    trace.record(BootstrapStep::Reinitialize, &result);

    match result {
        Ok(snapshot) => {
            mark_current(ledger);
            Ok(BootstrapReport {
                snapshot,
                steps: trace.steps,
            })
        }
        Err(_) => {
            tracing::error!("Config bootstrap exhausted every recovery step");
            Err(BootstrapFailure { steps: trace.steps })
        }
    }
}
