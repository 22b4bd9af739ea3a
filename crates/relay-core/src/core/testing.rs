//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::extension::{ExtensionConfig, ExtensionEntry};
use crate::gateway::{
    AgentTransport, ConfigGateway, ConfigSnapshot, CostTracker, ExtensionGateway, GatewayError,
    GatewayErrorKind, GatewayResult, ReadMode, RecipeSecurityScanner, ReplyEvent, ReplyRequest,
    ReplyStream, ResumeRequest, ScanReport, SecurityWarning, SessionMetadata, SessionSnapshot,
    StartRequest, ToolConfirmationAction,
};
use crate::recipe::Recipe;

fn failure(what: &str) -> GatewayError {
    GatewayError::new(GatewayErrorKind::HttpStatus, format!("{what} failed"))
}

#[derive(Default)]
struct Counters(Mutex<HashMap<&'static str, usize>>);

impl Counters {
    fn bump(&self, name: &'static str) -> usize {
        let mut map = self.0.lock().unwrap();
        let count = map.entry(name).or_default();
        *count += 1;
        *count
    }

    fn get(&self, name: &str) -> usize {
        self.0.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

/// Config store with scriptable failures.
#[derive(Default)]
pub struct FakeConfig {
    values: Mutex<Map<String, Value>>,
    calls: Counters,
    strict_failures: AtomicUsize,
    validate_failures: AtomicUsize,
    recover_fails: Mutex<bool>,
    reset_fails: Mutex<bool>,
}

impl FakeConfig {
    /// Provider and model configured, every operation succeeds.
    pub fn healthy() -> Self {
        let config = Self::default();
        config.set("GOOSE_PROVIDER", json!("openai"));
        config.set("GOOSE_MODEL", json!("gpt-4o"));
        config
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) {
        self.values.lock().unwrap().remove(key);
    }

    pub fn fail_strict_reads(&self, times: usize) {
        self.strict_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_validations(&self, times: usize) {
        self.validate_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_recover(&self, fails: bool) {
        *self.recover_fails.lock().unwrap() = fails;
    }

    pub fn fail_reset(&self, fails: bool) {
        *self.reset_fails.lock().unwrap() = fails;
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.get(name)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| if n == usize::MAX { n } else { n - 1 })
            })
            .is_ok()
    }
}

#[async_trait]
impl ConfigGateway for FakeConfig {
    async fn init(&self) -> GatewayResult<()> {
        self.calls.bump("init");
        Ok(())
    }

    async fn reset(&self) -> GatewayResult<()> {
        self.calls.bump("reset");
        if *self.reset_fails.lock().unwrap() {
            return Err(failure("reset"));
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> GatewayResult<Option<Value>> {
        self.calls.bump("read");
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn read_all(&self, mode: ReadMode) -> GatewayResult<ConfigSnapshot> {
        match mode {
            ReadMode::Strict => {
                self.calls.bump("read_all_strict");
                if Self::take_failure(&self.strict_failures) {
                    return Err(failure("strict read"));
                }
            }
            ReadMode::Lenient => {
                self.calls.bump("read_all_lenient");
            }
        }
        Ok(ConfigSnapshot {
            config: self.values.lock().unwrap().clone(),
        })
    }

    async fn validate(&self) -> GatewayResult<()> {
        self.calls.bump("validate");
        if Self::take_failure(&self.validate_failures) {
            return Err(failure("validate"));
        }
        Ok(())
    }

    async fn backup(&self) -> GatewayResult<()> {
        self.calls.bump("backup");
        Ok(())
    }

    async fn recover(&self) -> GatewayResult<()> {
        self.calls.bump("recover");
        if *self.recover_fails.lock().unwrap() {
            return Err(failure("recover"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExtensions {
    pub configured: Mutex<Vec<ExtensionEntry>>,
    pub added: Mutex<Vec<(String, String)>>,
    pub fail_on: Mutex<Option<String>>,
}

impl FakeExtensions {
    pub fn with(entries: &[(&str, bool)]) -> Self {
        let fake = Self::default();
        *fake.configured.lock().unwrap() = entries
            .iter()
            .map(|(name, enabled)| ExtensionEntry {
                enabled: *enabled,
                config: ExtensionConfig::new(*name),
            })
            .collect();
        fake
    }

    pub fn added_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .added
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ExtensionGateway for FakeExtensions {
    async fn list(&self) -> GatewayResult<Vec<ExtensionEntry>> {
        Ok(self.configured.lock().unwrap().clone())
    }

    async fn add_to_session(
        &self,
        session_id: &str,
        config: &ExtensionConfig,
    ) -> GatewayResult<()> {
        if self.fail_on.lock().unwrap().as_deref() == Some(config.name.as_str()) {
            return Err(failure("add extension"));
        }
        self.added
            .lock()
            .unwrap()
            .push((session_id.to_string(), config.name.clone()));
        Ok(())
    }
}

/// Scanner that counts invocations.
#[derive(Default)]
pub struct FakeScanner {
    pub warn: bool,
    pub scans: AtomicUsize,
}

impl FakeScanner {
    pub fn warning() -> Self {
        Self {
            warn: true,
            scans: AtomicUsize::new(0),
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecipeSecurityScanner for FakeScanner {
    async fn scan(&self, _recipe: &Recipe) -> GatewayResult<ScanReport> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(ScanReport {
            has_security_warnings: self.warn,
            warnings: if self.warn {
                vec![SecurityWarning {
                    kind: Some("prompt_injection".to_string()),
                    message: "Prompt asks to ignore previous instructions".to_string(),
                }]
            } else {
                Vec::new()
            },
        })
    }
}

pub struct FakeCost {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeCost {
    pub fn new(fail: bool) -> Self {
        Self {
            fail,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CostTracker for FakeCost {
    async fn initialize(&self) -> GatewayResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(failure("pricing"));
        }
        Ok(())
    }
}

/// Scripted reply for one `reply()` call.
pub enum ReplyScript {
    Events(Vec<GatewayResult<ReplyEvent>>),
    /// Events pushed by the test; ignores cancellation on purpose.
    Channel(mpsc::UnboundedReceiver<GatewayResult<ReplyEvent>>),
    Fail(GatewayError),
}

/// Transport with scripted sessions and replies.
pub struct FakeTransport {
    calls: Counters,
    pub start_delay: Duration,
    pub fail_start: Mutex<Option<GatewayError>>,
    pub fail_resume: Mutex<Option<GatewayError>>,
    pub echo_recipe: Mutex<Option<Recipe>>,
    pub history: Mutex<Vec<crate::conversation::Message>>,
    pub usage: Mutex<SessionMetadata>,
    pub starts: Mutex<Vec<StartRequest>>,
    pub resumes: Mutex<Vec<ResumeRequest>>,
    pub replies: Mutex<Vec<ReplyRequest>>,
    pub scripts: Mutex<VecDeque<ReplyScript>>,
    pub confirmations: Mutex<Vec<(String, String, ToolConfirmationAction)>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            calls: Counters::default(),
            start_delay: Duration::ZERO,
            fail_start: Mutex::new(None),
            fail_resume: Mutex::new(None),
            echo_recipe: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            usage: Mutex::new(SessionMetadata::default()),
            starts: Mutex::new(Vec::new()),
            resumes: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
            confirmations: Mutex::new(Vec::new()),
        }
    }
}

impl FakeTransport {
    pub fn slow(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.get(name)
    }

    pub fn script(&self, script: ReplyScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Queues a channel-backed reply and returns its sender.
    pub fn script_channel(&self) -> mpsc::UnboundedSender<GatewayResult<ReplyEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script(ReplyScript::Channel(rx));
        tx
    }

    pub fn last_reply(&self) -> Option<ReplyRequest> {
        self.replies.lock().unwrap().last().cloned()
    }

    fn snapshot(&self, session_id: String) -> SessionSnapshot {
        let mut metadata = self.usage.lock().unwrap().clone();
        metadata.recipe = self.echo_recipe.lock().unwrap().clone();
        SessionSnapshot {
            session_id,
            metadata,
            messages: self.history.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn start(&self, request: StartRequest) -> GatewayResult<SessionSnapshot> {
        let n = self.calls.bump("start");
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.starts.lock().unwrap().push(request);
        if let Some(err) = self.fail_start.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.snapshot(format!("session-{n}")))
    }

    async fn resume(&self, request: ResumeRequest) -> GatewayResult<SessionSnapshot> {
        self.calls.bump("resume");
        let id = request.session_id.clone();
        self.resumes.lock().unwrap().push(request);
        if let Some(err) = self.fail_resume.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.snapshot(id))
    }

    async fn session(&self, session_id: &str) -> GatewayResult<SessionSnapshot> {
        self.calls.bump("session");
        Ok(self.snapshot(session_id.to_string()))
    }

    async fn reply(
        &self,
        request: ReplyRequest,
        _cancel: CancellationToken,
    ) -> GatewayResult<ReplyStream> {
        self.calls.bump("reply");
        self.replies.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(ReplyScript::Events(events)) => Ok(stream::iter(events).boxed()),
            Some(ReplyScript::Channel(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed()),
            Some(ReplyScript::Fail(err)) => Err(err),
            None => Ok(stream::empty().boxed()),
        }
    }

    async fn confirm_tool(
        &self,
        session_id: &str,
        request_id: &str,
        action: ToolConfirmationAction,
    ) -> GatewayResult<()> {
        self.confirmations.lock().unwrap().push((
            session_id.to_string(),
            request_id.to_string(),
            action,
        ));
        Ok(())
    }
}
