//! Step interpreter: drives a compiled program against one session.
//!
//! Steps execute strictly in declaration order. Control-flow nodes
//! (conditionals, loops) gate or repeat their nested bodies; everything
//! else dispatches to one browser primitive. All string-valued config
//! fields pass through variable substitution before use. A failed step
//! unwinds the whole run unless it is marked `continue_on_error`.

use crate::browser::BrowserSession;
use crate::condition::{self, Condition};
use crate::error::{EngineError, Result};
use crate::program::{
    ActionKind, ActionStep, LoopSource, Program, StepNode, StorageAction,
};
use crate::substitute::{substitute, substitute_str};
use crate::types::{
    EngineConfig, ExecutionContext, LogLevel, LoopContext, RunEvent, StepResult, VariableMap,
};
use async_recursion::async_recursion;
use base64::Engine as _;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Position of a top-level node, used for proportional loop progress.
#[derive(Debug, Clone, Copy)]
struct ProgressSlot {
    index: usize,
    total: usize,
}

pub(crate) struct StepInterpreter<'a> {
    session: &'a mut dyn BrowserSession,
    config: &'a EngineConfig,
    context: &'a mut ExecutionContext,
    events: &'a mpsc::Sender<RunEvent>,
}

impl<'a> StepInterpreter<'a> {
    pub(crate) fn new(
        session: &'a mut dyn BrowserSession,
        config: &'a EngineConfig,
        context: &'a mut ExecutionContext,
        events: &'a mpsc::Sender<RunEvent>,
    ) -> Self {
        Self {
            session,
            config,
            context,
            events,
        }
    }

    pub(crate) async fn run(&mut self, program: &Program) -> Result<()> {
        let total = program.nodes.len();
        for (index, node) in program.nodes.iter().enumerate() {
            self.execute_node(node, Some(ProgressSlot { index, total }))
                .await?;
            self.send_progress(index + 1, total, (index + 1) as f64).await;
        }
        Ok(())
    }

    #[async_recursion]
    async fn execute_node(&mut self, node: &StepNode, slot: Option<ProgressSlot>) -> Result<()> {
        match node {
            StepNode::Action(step) => self.execute_action_step(step).await,
            StepNode::Conditional {
                step_id,
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.substituted_condition(condition)?;
                let vars = self.scoped_variables();
                let matched = condition::evaluate(&condition, &mut *self.session, &vars).await;
                debug!(step_id = %step_id, matched, "conditional evaluated");
                self.emit(RunEvent::StepCompleted {
                    step_id: step_id.clone(),
                    result: StepResult::ok(Some(json!({ "matched": matched }))),
                })
                .await;
                let branch = if matched { then_branch } else { else_branch };
                for child in branch {
                    self.execute_node(child, None).await?;
                }
                Ok(())
            }
            StepNode::Loop {
                step_id,
                source,
                max_iterations,
                break_if,
                body,
            } => {
                self.execute_loop(step_id, source, *max_iterations, break_if.as_ref(), body, slot)
                    .await
            }
        }
    }

    async fn execute_loop(
        &mut self,
        step_id: &str,
        source: &LoopSource,
        max_iterations: Option<usize>,
        break_if: Option<&Condition>,
        body: &[StepNode],
        slot: Option<ProgressSlot>,
    ) -> Result<()> {
        let vars = self.scoped_variables();
        let available = match source {
            LoopSource::Count(count) => *count,
            LoopSource::Elements { selector } => {
                let selector = substitute_str(selector, &vars);
                self.session.query_count(&selector).await.map_err(|err| {
                    EngineError::Automation(format!("loop '{step_id}' selector failed: {err}"))
                })?
            }
        };
        let bound = max_iterations.map_or(available, |max| available.min(max));
        let elements_mode = matches!(source, LoopSource::Elements { .. });
        debug!(step_id = %step_id, bound, elements_mode, "entering loop");

        let saved = self.context.loop_context.take();
        self.context.loop_context = Some(LoopContext {
            step_id: step_id.to_string(),
            total_iterations: bound,
            current_iteration: 0,
            current_element: elements_mode.then_some(0),
            should_break: false,
        });

        let mut completed = 0usize;
        let outcome = self
            .run_iterations(step_id, bound, elements_mode, break_if, body, slot, &mut completed)
            .await;
        self.context.loop_context = saved;
        outcome?;

        self.emit(RunEvent::StepCompleted {
            step_id: step_id.to_string(),
            result: StepResult::ok(Some(json!({ "iterations": completed }))),
        })
        .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iterations(
        &mut self,
        step_id: &str,
        bound: usize,
        elements_mode: bool,
        break_if: Option<&Condition>,
        body: &[StepNode],
        slot: Option<ProgressSlot>,
        completed: &mut usize,
    ) -> Result<()> {
        for iteration in 0..bound {
            if let Some(ctx) = self.context.loop_context.as_mut() {
                ctx.current_iteration = iteration;
                ctx.current_element = elements_mode.then_some(iteration);
            }

            for child in body {
                self.execute_node(child, None).await?;
            }
            *completed += 1;

            if let Some(condition) = break_if {
                let condition = self.substituted_condition(condition)?;
                let vars = self.scoped_variables();
                if condition::evaluate(&condition, &mut *self.session, &vars).await {
                    if let Some(ctx) = self.context.loop_context.as_mut() {
                        ctx.should_break = true;
                    }
                }
            }
            if self
                .context
                .loop_context
                .as_ref()
                .is_some_and(|ctx| ctx.should_break)
            {
                self.emit(RunEvent::Log {
                    level: LogLevel::Info,
                    message: format!(
                        "Loop '{step_id}' break condition met after {completed} iterations"
                    ),
                    step_id: Some(step_id.to_string()),
                })
                .await;
                break;
            }

            if let Some(slot) = slot {
                let fraction = (iteration + 1) as f64 / bound as f64;
                self.send_progress(slot.index, slot.total, slot.index as f64 + fraction)
                    .await;
            }
        }
        Ok(())
    }

    async fn execute_action_step(&mut self, step: &ActionStep) -> Result<()> {
        debug!(step_id = %step.id, "executing step");
        let mut result = match tokio::time::timeout(self.config.step_timeout, self.run_action(step))
            .await
        {
            Ok(Ok((data, screenshot))) => StepResult {
                success: true,
                data,
                error: None,
                screenshot,
            },
            Ok(Err(err)) => StepResult::failed(err.to_string()),
            Err(_) => StepResult::failed(EngineError::StepTimeout(step.id.clone()).to_string()),
        };

        if result.success {
            self.emit(RunEvent::StepCompleted {
                step_id: step.id.clone(),
                result,
            })
            .await;
            return Ok(());
        }

        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());
        if step.continue_on_error {
            self.emit(RunEvent::Log {
                level: LogLevel::Warning,
                message: format!("Step '{}' failed, continuing: {message}", step.id),
                step_id: Some(step.id.clone()),
            })
            .await;
            self.emit(RunEvent::StepCompleted {
                step_id: step.id.clone(),
                result,
            })
            .await;
            return Ok(());
        }

        if self.config.screenshot_on_error && result.screenshot.is_none() {
            // best effort; a dead session just means no screenshot
            if let Ok(bytes) = self.session.screenshot(false).await {
                result.screenshot = Some(bytes);
            }
        }
        self.emit(RunEvent::Log {
            level: LogLevel::Error,
            message: format!("Step '{}' failed: {message}", step.id),
            step_id: Some(step.id.clone()),
        })
        .await;
        self.emit(RunEvent::StepCompleted {
            step_id: step.id.clone(),
            result,
        })
        .await;
        Err(EngineError::Automation(message))
    }

    async fn run_action(&mut self, step: &ActionStep) -> Result<(Option<Value>, Option<Vec<u8>>)> {
        let vars = self.scoped_variables();
        match &step.kind {
            ActionKind::Navigate(config) => {
                let url = substitute_str(&config.url, &vars);
                self.session.navigate(&url).await?;
                Ok((Some(json!({ "url": url })), None))
            }
            ActionKind::Click(config) => {
                let selector = substitute_str(&config.selector, &vars);
                self.session.click(&selector).await?;
                Ok((None, None))
            }
            ActionKind::RightClick(config) => {
                let selector = substitute_str(&config.selector, &vars);
                self.session.right_click(&selector).await?;
                Ok((None, None))
            }
            ActionKind::DoubleClick(config) => {
                let selector = substitute_str(&config.selector, &vars);
                self.session.double_click(&selector).await?;
                Ok((None, None))
            }
            ActionKind::Fill(config) => {
                let selector = substitute_str(&config.selector, &vars);
                let value = substitute_str(&config.value, &vars);
                self.session.fill(&selector, &value).await?;
                Ok((None, None))
            }
            ActionKind::Hover(config) => {
                let selector = substitute_str(&config.selector, &vars);
                self.session.hover(&selector).await?;
                Ok((None, None))
            }
            ActionKind::Extract(config) => {
                let selector = substitute_str(&config.selector, &vars);
                let value = if config.multiple {
                    match &config.attribute {
                        Some(attr) => Value::Array(
                            self.session
                                .attributes(&selector, attr)
                                .await?
                                .into_iter()
                                .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                                .collect(),
                        ),
                        None => Value::Array(
                            self.session
                                .text_contents(&selector)
                                .await?
                                .into_iter()
                                .map(Value::String)
                                .collect(),
                        ),
                    }
                } else {
                    self.extract_single(&selector, config.attribute.as_deref())
                        .await?
                };
                self.context
                    .extracted_data
                    .insert(config.field.clone(), value.clone());
                Ok((Some(value), None))
            }
            ActionKind::ExtractToVariable(config) => {
                let selector = substitute_str(&config.selector, &vars);
                let value = self
                    .extract_single(&selector, config.attribute.as_deref())
                    .await?;
                self.context
                    .variables
                    .insert(config.variable.clone(), value.clone());
                Ok((Some(value), None))
            }
            ActionKind::Wait(config) => {
                match (&config.selector, config.duration_ms) {
                    (Some(selector), bound) => {
                        let selector = substitute_str(selector, &vars);
                        let timeout = bound
                            .map(Duration::from_millis)
                            .unwrap_or(self.config.step_timeout);
                        self.session.wait_for_selector(&selector, timeout).await?;
                    }
                    (None, Some(ms)) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    // rejected at compile time
                    (None, None) => {}
                }
                Ok((None, None))
            }
            ActionKind::Screenshot(config) => {
                let bytes = self.session.screenshot(config.full_page).await?;
                Ok((Some(json!({ "size": bytes.len() })), Some(bytes)))
            }
            ActionKind::Scroll(config) => {
                match &config.selector {
                    Some(selector) => {
                        let selector = substitute_str(selector, &vars);
                        self.session.scroll_to(&selector).await?;
                    }
                    None => {
                        self.session
                            .scroll_by(config.delta_x, config.delta_y)
                            .await?;
                    }
                }
                Ok((None, None))
            }
            ActionKind::PressKey(config) => {
                let key = substitute_str(&config.key, &vars);
                let selector = config.selector.as_ref().map(|s| substitute_str(s, &vars));
                self.session.press_key(&key, selector.as_deref()).await?;
                Ok((None, None))
            }
            ActionKind::ExecuteJs(config) => {
                let script = substitute_str(&config.script, &vars);
                let result = self
                    .session
                    .evaluate(&script, Value::Object(vars.clone()))
                    .await?;
                if let Some(field) = &config.field {
                    self.context
                        .extracted_data
                        .insert(field.clone(), result.clone());
                }
                Ok((Some(result), None))
            }
            ActionKind::SetVariable(config) => {
                let value = substitute(&config.value, &vars);
                self.context
                    .variables
                    .insert(config.name.clone(), value.clone());
                Ok((Some(value), None))
            }
            ActionKind::DownloadFile(config) => {
                let url = substitute_str(&config.url, &vars);
                let filename = substitute_str(&config.filename, &vars);
                let bytes = self.session.download(&url).await?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                Ok((
                    Some(json!({
                        "filename": filename,
                        "size": bytes.len(),
                        "content_base64": encoded,
                    })),
                    None,
                ))
            }
            ActionKind::DragDrop(config) => {
                let source = substitute_str(&config.source, &vars);
                let target = substitute_str(&config.target, &vars);
                self.session.drag_and_drop(&source, &target).await?;
                Ok((None, None))
            }
            ActionKind::Cookie(config) => {
                let name = substitute_str(&config.name, &vars);
                match config.action {
                    StorageAction::Get => {
                        let value = self
                            .session
                            .cookie(&name)
                            .await?
                            .map(Value::String)
                            .unwrap_or(Value::Null);
                        if let Some(field) = &config.field {
                            self.context
                                .extracted_data
                                .insert(field.clone(), value.clone());
                        }
                        Ok((Some(value), None))
                    }
                    StorageAction::Set => {
                        let value =
                            substitute_str(config.value.as_deref().unwrap_or_default(), &vars);
                        self.session.set_cookie(&name, &value).await?;
                        Ok((None, None))
                    }
                }
            }
            ActionKind::LocalStorage(config) => {
                let key = substitute_str(&config.key, &vars);
                match config.action {
                    StorageAction::Get => {
                        let value = self
                            .session
                            .local_storage(&key)
                            .await?
                            .map(Value::String)
                            .unwrap_or(Value::Null);
                        if let Some(field) = &config.field {
                            self.context
                                .extracted_data
                                .insert(field.clone(), value.clone());
                        }
                        Ok((Some(value), None))
                    }
                    StorageAction::Set => {
                        let value =
                            substitute_str(config.value.as_deref().unwrap_or_default(), &vars);
                        self.session.set_local_storage(&key, &value).await?;
                        Ok((None, None))
                    }
                }
            }
            ActionKind::SelectDropdown(config) => {
                let selector = substitute_str(&config.selector, &vars);
                let value = substitute_str(&config.value, &vars);
                self.session.select_option(&selector, &value).await?;
                Ok((None, None))
            }
        }
    }

    async fn extract_single(&mut self, selector: &str, attribute: Option<&str>) -> Result<Value> {
        let extracted = match attribute {
            Some(attr) => self.session.attribute(selector, attr).await?,
            None => self.session.text_content(selector).await?,
        };
        Ok(extracted.map(Value::String).unwrap_or(Value::Null))
    }

    /// Variable bag plus the reserved `loop` view while inside a loop.
    fn scoped_variables(&self) -> VariableMap {
        let mut vars = self.context.variables.clone();
        if let Some(ctx) = &self.context.loop_context {
            vars.insert(
                "loop".to_string(),
                json!({
                    "index": ctx.current_iteration,
                    "iteration": ctx.current_iteration + 1,
                    "total": ctx.total_iterations,
                    "element": ctx.current_element,
                }),
            );
        }
        vars
    }

    /// Substitute `${...}` placeholders in a condition's string fields.
    fn substituted_condition(&self, condition: &Condition) -> Result<Condition> {
        let raw = serde_json::to_value(condition)?;
        let vars = self.scoped_variables();
        Ok(serde_json::from_value(substitute(&raw, &vars))?)
    }

    async fn send_progress(&self, current_step: usize, total_steps: usize, completed_units: f64) {
        let total = total_steps.max(1) as f64;
        let percentage = ((completed_units / total) * 100.0).round() as u8;
        self.emit(RunEvent::Progress {
            current_step,
            total_steps,
            percentage,
        })
        .await;
    }

    async fn emit(&self, event: RunEvent) {
        // a dropped receiver means nobody is listening; the run goes on
        let _ = self.events.send(event).await;
    }
}
