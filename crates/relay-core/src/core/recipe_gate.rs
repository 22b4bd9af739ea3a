//! Recipe gating: acceptance, security scan, and parameter collection.
//!
//! A recipe must be accepted before its parameters are collected, and its
//! parameters must be collected before the first message is sent.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Captures, Regex};

use super::session::{ParameterValues, Session};
use crate::gateway::{GatewayResult, RecipeSecurityScanner, ScanReport, SecurityWarning};
use crate::recipe::{Recipe, RecipeParameter};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").unwrap_or_else(|e| panic!("placeholder regex: {e}"))
});

/// Replaces `{{ key }}` placeholders with values from `params`.
///
/// Keys match case-sensitively. Placeholders without a value are kept as-is.
pub fn substitute(template: &str, params: &ParameterValues) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match params.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Text sources a recipe's placeholders may appear in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSources<'a> {
    pub prompt: Option<&'a str>,
    pub instructions: Option<&'a str>,
    pub activities: &'a [String],
}

impl<'a> TemplateSources<'a> {
    pub fn of(recipe: &'a Recipe) -> Self {
        Self {
            prompt: recipe.prompt.as_deref(),
            instructions: recipe.instructions.as_deref(),
            activities: recipe.activities.as_deref().unwrap_or_default(),
        }
    }

    fn placeholder_keys(&self) -> HashSet<&'a str> {
        self.prompt
            .into_iter()
            .chain(self.instructions)
            .chain(self.activities.iter().map(String::as_str))
            .flat_map(|text| PLACEHOLDER.captures_iter(text))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect()
    }
}

/// Declared parameters actually referenced by a placeholder in `sources`.
pub fn filter_used_parameters(
    declared: &[RecipeParameter],
    sources: TemplateSources<'_>,
) -> Vec<RecipeParameter> {
    let used = sources.placeholder_keys();
    declared
        .iter()
        .filter(|p| used.contains(p.key.as_str()))
        .cloned()
        .collect()
}

/// `given` plus declared defaults for keys the user did not supply.
pub fn resolve_parameters(declared: &[RecipeParameter], given: &ParameterValues) -> ParameterValues {
    let mut resolved = given.clone();
    for param in declared {
        if let Some(default) = &param.default {
            resolved
                .entry(param.key.clone())
                .or_insert_with(|| default.clone());
        }
    }
    resolved
}

/// Keys of required `used` parameters with neither a non-blank value nor a
/// non-blank default.
pub fn missing_parameters(used: &[RecipeParameter], values: &ParameterValues) -> Vec<String> {
    used.iter()
        .filter(|p| p.is_required())
        .filter(|p| {
            values
                .get(&p.key)
                .or(p.default.as_ref())
                .is_none_or(|v| v.trim().is_empty())
        })
        .map(|p| p.key.clone())
        .collect()
}

/// The recipe prompt with parameters (and their defaults) substituted.
pub fn initial_prompt(recipe: &Recipe, given: &ParameterValues) -> Option<String> {
    let values = resolve_parameters(recipe.declared_parameters(), given);
    recipe
        .prompt
        .as_deref()
        .map(|prompt| substitute(prompt, &values))
}

/// Remembers which recipe contents the user accepted.
pub trait AcceptanceStore: Send + Sync {
    fn is_accepted(&self, hash: &str) -> Result<bool>;
    /// Records `hash`. Returns false if it was already recorded.
    fn record(&self, hash: &str) -> Result<bool>;
}

/// One `<hash>.hash` file per accepted recipe, holding the acceptance time.
#[derive(Debug, Clone)]
pub struct FileAcceptanceStore {
    dir: PathBuf,
}

impl FileAcceptanceStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.hash"))
    }
}

impl AcceptanceStore for FileAcceptanceStore {
    fn is_accepted(&self, hash: &str) -> Result<bool> {
        Ok(self.path(hash).is_file())
    }

    fn record(&self, hash: &str) -> Result<bool> {
        let path = self.path(hash);
        if path.is_file() {
            return Ok(false);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        fs::write(&path, chrono::Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryAcceptanceStore {
    hashes: Mutex<HashSet<String>>,
}

impl AcceptanceStore for MemoryAcceptanceStore {
    fn is_accepted(&self, hash: &str) -> Result<bool> {
        Ok(self
            .hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash))
    }

    fn record(&self, hash: &str) -> Result<bool> {
        Ok(self
            .hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string()))
    }
}

/// Scanner that needs no server: flags invisible Unicode tag characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnicodeTagScanner;

fn contains_unicode_tags(text: &str) -> bool {
    text.chars().any(|c| ('\u{E0000}'..='\u{E007F}').contains(&c))
}

#[async_trait]
impl RecipeSecurityScanner for UnicodeTagScanner {
    async fn scan(&self, recipe: &Recipe) -> GatewayResult<ScanReport> {
        let sources = TemplateSources::of(recipe);
        let fields = [("prompt", sources.prompt), ("instructions", sources.instructions)];
        let mut warnings: Vec<SecurityWarning> = fields
            .into_iter()
            .filter(|(_, text)| text.is_some_and(contains_unicode_tags))
            .map(|(field, _)| SecurityWarning {
                kind: Some("hidden_text".to_string()),
                message: format!("Recipe {field} contains hidden Unicode tag characters"),
            })
            .collect();
        if sources.activities.iter().any(|a| contains_unicode_tags(a)) {
            warnings.push(SecurityWarning {
                kind: Some("hidden_text".to_string()),
                message: "Recipe activities contain hidden Unicode tag characters".to_string(),
            });
        }
        Ok(ScanReport {
            has_security_warnings: !warnings.is_empty(),
            warnings,
        })
    }
}

/// Where a recipe came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeOrigin {
    /// Opened by the user (file, link, deeplink).
    Loaded,
    /// Echoed back from a session that already ran it.
    SessionHistory,
}

impl RecipeOrigin {
    /// Only a recipe echoed by the server's session record has run before;
    /// one supplied by the caller counts as freshly loaded even on resume.
    pub fn of(session: &Session) -> Self {
        if session.recipe_from_server {
            RecipeOrigin::SessionHistory
        } else {
            RecipeOrigin::Loaded
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateEvaluation {
    pub accepted: bool,
    /// Present only when a scan ran.
    pub security: Option<ScanReport>,
    pub used_parameters: Vec<RecipeParameter>,
    pub requires_parameters: bool,
}

impl GateEvaluation {
    pub fn has_security_warnings(&self) -> bool {
        self.security
            .as_ref()
            .is_some_and(|report| report.has_security_warnings)
    }

    pub fn has_all_required_parameters(&self, given: &ParameterValues) -> bool {
        missing_parameters(&self.used_parameters, given).is_empty()
    }

    pub fn warnings(&self) -> &[SecurityWarning] {
        self.security
            .as_ref()
            .map_or(&[][..], |report| report.warnings.as_slice())
    }
}

pub struct RecipeGate {
    scanner: Arc<dyn RecipeSecurityScanner>,
    store: Arc<dyn AcceptanceStore>,
}

impl RecipeGate {
    pub fn new(scanner: Arc<dyn RecipeSecurityScanner>, store: Arc<dyn AcceptanceStore>) -> Self {
        Self { scanner, store }
    }

    pub async fn evaluate(&self, recipe: &Recipe, origin: RecipeOrigin) -> Result<GateEvaluation> {
        let used_parameters =
            filter_used_parameters(recipe.declared_parameters(), TemplateSources::of(recipe));
        let requires_parameters = !used_parameters.is_empty();

        let hash = recipe.content_hash()?;
        let mut accepted = self.store.is_accepted(&hash)?;
        if !accepted && origin == RecipeOrigin::SessionHistory {
            self.store.record(&hash)?;
            accepted = true;
        }

        let security = if accepted {
            None
        } else {
            let report = self
                .scanner
                .scan(recipe)
                .await
                .context("Recipe security scan failed")?;
            if report.has_security_warnings {
                tracing::warn!(
                    title = %recipe.title,
                    warnings = report.warnings.len(),
                    "Recipe has security warnings"
                );
            }
            Some(report)
        };

        Ok(GateEvaluation {
            accepted,
            security,
            used_parameters,
            requires_parameters,
        })
    }

    /// Records acceptance of this exact recipe content. Idempotent.
    pub fn accept(&self, recipe: &Recipe) -> Result<()> {
        let hash = recipe.content_hash()?;
        if self.store.record(&hash)? {
            tracing::info!(title = %recipe.title, "Recipe accepted");
        }
        Ok(())
    }
}

/// Which gate the caller must show next.
#[derive(Debug, Clone, PartialEq)]
pub enum GatePhase {
    AwaitingAcceptance,
    AwaitingParameters(Vec<String>),
    Ready,
}

/// Orders acceptance before parameters before the first message.
#[derive(Debug, Clone)]
pub struct RecipeGateFlow {
    evaluation: GateEvaluation,
    prompted_for_parameters: bool,
}

impl RecipeGateFlow {
    pub fn new(evaluation: GateEvaluation) -> Self {
        Self {
            evaluation,
            prompted_for_parameters: false,
        }
    }

    pub fn evaluation(&self) -> &GateEvaluation {
        &self.evaluation
    }

    pub fn mark_accepted(&mut self) {
        self.evaluation.accepted = true;
    }

    /// Parameter collection is offered at most once, and only before any
    /// message exists.
    pub fn next_phase(&mut self, given: &ParameterValues, has_messages: bool) -> GatePhase {
        if !self.evaluation.accepted {
            return GatePhase::AwaitingAcceptance;
        }
        if has_messages || self.prompted_for_parameters {
            return GatePhase::Ready;
        }
        let missing = missing_parameters(&self.evaluation.used_parameters, given);
        if missing.is_empty() {
            GatePhase::Ready
        } else {
            self.prompted_for_parameters = true;
            GatePhase::AwaitingParameters(missing)
        }
    }
}

/// Values keyed by parameter key, parsed from `KEY=VALUE` pairs.
pub fn parse_parameter_pairs<'a>(
    pairs: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>> {
    pairs
        .into_iter()
        .map(|pair| -> Result<(String, String)> {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Invalid parameter '{pair}': expected KEY=VALUE"))?;
            let key = key.trim();
            anyhow::ensure!(!key.is_empty(), "Invalid parameter '{pair}': empty key");
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
