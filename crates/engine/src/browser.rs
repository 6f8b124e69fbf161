//! Browser collaborator boundary.
//!
//! Driving a real browser engine is outside this crate. The interpreter
//! talks to these traits; an adapter binds them to an actual automation
//! backend. Every run gets its own exclusively-owned session, never
//! shared across runs, which is what keeps tenant state (cookies,
//! storage, credentials) from leaking between executions.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Options for opening an isolated session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub headless: bool,
}

/// Allocates isolated browser sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>>;
}

/// One exclusively-owned browser session.
///
/// Faults surface as [`crate::error::EngineError::Automation`]; bounded
/// waits that elapse without a match return their "absent" value rather
/// than an error where the signature allows it (`is_visible`).
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<()>;
    async fn click(&mut self, selector: &str) -> Result<()>;
    async fn right_click(&mut self, selector: &str) -> Result<()>;
    async fn double_click(&mut self, selector: &str) -> Result<()>;
    async fn fill(&mut self, selector: &str, value: &str) -> Result<()>;
    async fn hover(&mut self, selector: &str) -> Result<()>;
    /// `selector` focuses the element first; `None` sends to the page.
    async fn press_key(&mut self, key: &str, selector: Option<&str>) -> Result<()>;
    async fn scroll_to(&mut self, selector: &str) -> Result<()>;
    async fn scroll_by(&mut self, dx: i64, dy: i64) -> Result<()>;
    async fn select_option(&mut self, selector: &str, value: &str) -> Result<()>;
    async fn drag_and_drop(&mut self, source: &str, target: &str) -> Result<()>;
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<()>;
    /// Text content of the first match, `None` when nothing matches.
    async fn text_content(&mut self, selector: &str) -> Result<Option<String>>;
    /// Text content of every match, in document order.
    async fn text_contents(&mut self, selector: &str) -> Result<Vec<String>>;
    /// Attribute of the first match.
    async fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>>;
    /// Attribute of every match, in document order.
    async fn attributes(&mut self, selector: &str, name: &str) -> Result<Vec<Option<String>>>;
    async fn query_count(&mut self, selector: &str) -> Result<usize>;
    /// Whether the first match becomes visible within `timeout`. A
    /// timeout is `Ok(false)`, not an error.
    async fn is_visible(&mut self, selector: &str, timeout: Duration) -> Result<bool>;
    /// Run `script` in the page's scripting context with `args` injected.
    async fn evaluate(&mut self, script: &str, args: Value) -> Result<Value>;
    async fn screenshot(&mut self, full_page: bool) -> Result<Vec<u8>>;
    async fn download(&mut self, url: &str) -> Result<Vec<u8>>;
    async fn cookie(&mut self, name: &str) -> Result<Option<String>>;
    async fn set_cookie(&mut self, name: &str, value: &str) -> Result<()>;
    async fn local_storage(&mut self, key: &str) -> Result<Option<String>>;
    async fn set_local_storage(&mut self, key: &str, value: &str) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}
