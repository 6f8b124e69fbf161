//! Scripted fake browser shared by the integration tests.

use async_trait::async_trait;
use autopilot_engine::browser::{BrowserDriver, BrowserSession, SessionOptions};
use autopilot_engine::error::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub visible: bool,
}

impl FakeElement {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            attributes: HashMap::new(),
            visible: true,
        }
    }

    #[allow(dead_code)]
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    #[allow(dead_code)]
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

#[derive(Default)]
struct DriverState {
    elements: RwLock<HashMap<String, Vec<FakeElement>>>,
    script_results: RwLock<HashMap<String, Value>>,
    actions: Mutex<Vec<String>>,
    fail_selectors: RwLock<HashSet<String>>,
    fail_open: AtomicBool,
    action_delay: Mutex<Duration>,
    sessions_opened: AtomicUsize,
    open_sessions: AtomicUsize,
    max_open_seen: AtomicUsize,
}

/// Fake driver: one shared page model, scripted failures, and an action
/// log ordered across all sessions.
#[derive(Default)]
pub struct FakeDriver {
    state: Arc<DriverState>,
}

#[allow(dead_code)]
impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Coerce the shared handle into the trait object the engine expects.
    pub fn clone_dyn(self: &Arc<Self>) -> Arc<dyn BrowserDriver> {
        self.clone()
    }

    pub fn set_elements(&self, selector: &str, elements: Vec<FakeElement>) {
        self.state
            .elements
            .write()
            .insert(selector.to_string(), elements);
    }

    pub fn set_script_result(&self, script: &str, result: Value) {
        self.state
            .script_results
            .write()
            .insert(script.to_string(), result);
    }

    pub fn fail_selector(&self, selector: &str) {
        self.state.fail_selectors.write().insert(selector.to_string());
    }

    pub fn refuse_sessions(&self) {
        self.state.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn set_action_delay(&self, delay: Duration) {
        *self.state.action_delay.lock() = delay;
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.actions.lock().clone()
    }

    pub fn count_actions(&self, prefix: &str) -> usize {
        self.state
            .actions
            .lock()
            .iter()
            .filter(|action| action.starts_with(prefix))
            .count()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    pub fn max_open_seen(&self) -> usize {
        self.state.max_open_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn open_session(&self, _options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::Session("browser refused to launch".into()));
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let open = self.state.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open_seen.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            cookies: HashMap::new(),
            storage: HashMap::new(),
        }))
    }
}

pub struct FakeSession {
    state: Arc<DriverState>,
    cookies: HashMap<String, String>,
    storage: HashMap<String, String>,
}

impl FakeSession {
    async fn record(&self, action: String) {
        let delay = *self.state.action_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.actions.lock().push(action);
    }

    fn check_selector(&self, selector: &str) -> Result<()> {
        if self.state.fail_selectors.read().contains(selector) {
            return Err(EngineError::Automation(format!(
                "no element matches '{selector}'"
            )));
        }
        Ok(())
    }

    fn elements(&self, selector: &str) -> Vec<FakeElement> {
        self.state
            .elements
            .read()
            .get(selector)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.record(format!("navigate:{url}")).await;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("click:{selector}")).await;
        Ok(())
    }

    async fn right_click(&mut self, selector: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("right_click:{selector}")).await;
        Ok(())
    }

    async fn double_click(&mut self, selector: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("double_click:{selector}")).await;
        Ok(())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("fill:{selector}={value}")).await;
        Ok(())
    }

    async fn hover(&mut self, selector: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("hover:{selector}")).await;
        Ok(())
    }

    async fn press_key(&mut self, key: &str, selector: Option<&str>) -> Result<()> {
        self.record(format!("press_key:{key}@{}", selector.unwrap_or("page")))
            .await;
        Ok(())
    }

    async fn scroll_to(&mut self, selector: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("scroll_to:{selector}")).await;
        Ok(())
    }

    async fn scroll_by(&mut self, dx: i64, dy: i64) -> Result<()> {
        self.record(format!("scroll_by:{dx},{dy}")).await;
        Ok(())
    }

    async fn select_option(&mut self, selector: &str, value: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("select:{selector}={value}")).await;
        Ok(())
    }

    async fn drag_and_drop(&mut self, source: &str, target: &str) -> Result<()> {
        self.record(format!("drag:{source}->{target}")).await;
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<()> {
        if self.elements(selector).is_empty() {
            return Err(EngineError::Automation(format!(
                "timed out waiting for '{selector}'"
            )));
        }
        self.record(format!("wait:{selector}")).await;
        Ok(())
    }

    async fn text_content(&mut self, selector: &str) -> Result<Option<String>> {
        self.check_selector(selector)?;
        Ok(self.elements(selector).first().map(|e| e.text.clone()))
    }

    async fn text_contents(&mut self, selector: &str) -> Result<Vec<String>> {
        self.check_selector(selector)?;
        Ok(self
            .elements(selector)
            .iter()
            .map(|e| e.text.clone())
            .collect())
    }

    async fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>> {
        self.check_selector(selector)?;
        Ok(self
            .elements(selector)
            .first()
            .and_then(|e| e.attributes.get(name).cloned()))
    }

    async fn attributes(&mut self, selector: &str, name: &str) -> Result<Vec<Option<String>>> {
        self.check_selector(selector)?;
        Ok(self
            .elements(selector)
            .iter()
            .map(|e| e.attributes.get(name).cloned())
            .collect())
    }

    async fn query_count(&mut self, selector: &str) -> Result<usize> {
        self.check_selector(selector)?;
        Ok(self.elements(selector).len())
    }

    async fn is_visible(&mut self, selector: &str, _timeout: Duration) -> Result<bool> {
        Ok(self
            .elements(selector)
            .first()
            .map(|e| e.visible)
            .unwrap_or(false))
    }

    async fn evaluate(&mut self, script: &str, _args: Value) -> Result<Value> {
        self.record(format!("evaluate:{script}")).await;
        Ok(self
            .state
            .script_results
            .read()
            .get(script)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn screenshot(&mut self, full_page: bool) -> Result<Vec<u8>> {
        self.record(format!("screenshot:{full_page}")).await;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn download(&mut self, url: &str) -> Result<Vec<u8>> {
        self.record(format!("download:{url}")).await;
        Ok(b"file-bytes".to_vec())
    }

    async fn cookie(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.cookies.get(name).cloned())
    }

    async fn set_cookie(&mut self, name: &str, value: &str) -> Result<()> {
        self.cookies.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn local_storage(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.storage.get(key).cloned())
    }

    async fn set_local_storage(&mut self, key: &str, value: &str) -> Result<()> {
        self.storage.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.record("close".to_string()).await;
        self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
