//! Compilation of stored workflow definitions into an executable program.
//!
//! The persisted form is a flat list of `{type, config}` steps with the
//! bodies of control-flow steps nested inside their configs. Compilation
//! turns that into a typed tree once per run, so the interpreter never
//! re-derives control flow and an invalid definition is rejected before
//! any step executes.

use crate::condition::Condition;
use crate::error::{EngineError, Result};
use crate::types::{WorkflowDefinition, WorkflowStep};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

/// Executable form of a definition.
#[derive(Debug, Clone)]
pub struct Program {
    pub nodes: Vec<StepNode>,
}

impl Program {
    pub fn compile(definition: &WorkflowDefinition) -> Result<Self> {
        let mut seen_ids = HashSet::new();
        let nodes = compile_steps(&definition.steps, &mut seen_ids)?;
        Ok(Self { nodes })
    }
}

#[derive(Debug, Clone)]
pub enum StepNode {
    Action(ActionStep),
    Conditional {
        step_id: String,
        condition: Condition,
        then_branch: Vec<StepNode>,
        else_branch: Vec<StepNode>,
    },
    Loop {
        step_id: String,
        source: LoopSource,
        max_iterations: Option<usize>,
        /// Evaluated after each iteration; a match sets the loop's
        /// break flag and ends it early.
        break_if: Option<Condition>,
        body: Vec<StepNode>,
    },
}

#[derive(Debug, Clone)]
pub struct ActionStep {
    pub id: String,
    pub kind: ActionKind,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone)]
pub enum LoopSource {
    /// Fixed iteration count.
    Count(usize),
    /// One iteration per element matched by the selector.
    Elements { selector: String },
}

/// Closed set of non-control step kinds, each with its typed config.
#[derive(Debug, Clone)]
pub enum ActionKind {
    Navigate(NavigateConfig),
    Click(TargetConfig),
    RightClick(TargetConfig),
    DoubleClick(TargetConfig),
    Fill(FillConfig),
    Extract(ExtractConfig),
    ExtractToVariable(ExtractToVariableConfig),
    Wait(WaitConfig),
    Screenshot(ScreenshotConfig),
    Scroll(ScrollConfig),
    Hover(TargetConfig),
    PressKey(PressKeyConfig),
    ExecuteJs(ExecuteJsConfig),
    SetVariable(SetVariableConfig),
    DownloadFile(DownloadConfig),
    DragDrop(DragDropConfig),
    Cookie(CookieConfig),
    LocalStorage(LocalStorageConfig),
    SelectDropdown(SelectConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub selector: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillConfig {
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    pub selector: String,
    /// Attribute to read instead of text content.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Collect every match instead of the first.
    #[serde(default)]
    pub multiple: bool,
    /// Key in the run's extracted-data map; repeats overwrite.
    pub field: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractToVariableConfig {
    pub selector: String,
    #[serde(default)]
    pub attribute: Option<String>,
    pub variable: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitConfig {
    /// Wait for this selector to appear.
    #[serde(default)]
    pub selector: Option<String>,
    /// Fixed delay, or the selector wait bound when both are set.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenshotConfig {
    #[serde(default)]
    pub full_page: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrollConfig {
    /// Scroll the element into view; otherwise scroll by the deltas.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub delta_x: i64,
    #[serde(default)]
    pub delta_y: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PressKeyConfig {
    pub key: String,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteJsConfig {
    pub script: String,
    /// Store the script result in extracted data under this key.
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetVariableConfig {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DragDropConfig {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageAction {
    Get,
    Set,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    pub action: StorageAction,
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Extracted-data key for `get`.
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    pub action: StorageAction,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectConfig {
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct ConditionalConfig {
    condition: Condition,
    #[serde(default)]
    then_steps: Vec<WorkflowStep>,
    #[serde(default)]
    else_steps: Vec<WorkflowStep>,
}

#[derive(Debug, Deserialize)]
struct LoopConfig {
    #[serde(default)]
    iterations: Option<u64>,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    max_iterations: Option<u64>,
    #[serde(default)]
    break_if: Option<Condition>,
    #[serde(default)]
    steps: Vec<WorkflowStep>,
}

fn compile_steps(steps: &[WorkflowStep], seen_ids: &mut HashSet<String>) -> Result<Vec<StepNode>> {
    steps
        .iter()
        .map(|step| compile_step(step, seen_ids))
        .collect()
}

fn compile_step(step: &WorkflowStep, seen_ids: &mut HashSet<String>) -> Result<StepNode> {
    if !seen_ids.insert(step.id.clone()) {
        return Err(EngineError::InvalidDefinition(format!(
            "duplicate step id '{}'",
            step.id
        )));
    }

    match step.step_type.as_str() {
        "conditional" => {
            let config: ConditionalConfig = parse_config(step)?;
            Ok(StepNode::Conditional {
                step_id: step.id.clone(),
                condition: config.condition,
                then_branch: compile_steps(&config.then_steps, seen_ids)?,
                else_branch: compile_steps(&config.else_steps, seen_ids)?,
            })
        }
        "loop" => {
            let config: LoopConfig = parse_config(step)?;
            let source = match (config.iterations, &config.selector) {
                (Some(count), None) => LoopSource::Count(count as usize),
                (None, Some(selector)) => LoopSource::Elements {
                    selector: selector.clone(),
                },
                _ => {
                    return Err(EngineError::InvalidStepConfig {
                        step_id: step.id.clone(),
                        reason: "loop requires exactly one of `iterations` or `selector`".into(),
                    });
                }
            };
            Ok(StepNode::Loop {
                step_id: step.id.clone(),
                source,
                max_iterations: config.max_iterations.map(|m| m as usize),
                break_if: config.break_if,
                body: compile_steps(&config.steps, seen_ids)?,
            })
        }
        _ => Ok(StepNode::Action(ActionStep {
            id: step.id.clone(),
            kind: compile_action(step)?,
            continue_on_error: step.continue_on_error,
        })),
    }
}

fn compile_action(step: &WorkflowStep) -> Result<ActionKind> {
    let kind = match step.step_type.as_str() {
        "navigate" => ActionKind::Navigate(parse_config(step)?),
        "click" => ActionKind::Click(parse_config(step)?),
        "right_click" => ActionKind::RightClick(parse_config(step)?),
        "double_click" => ActionKind::DoubleClick(parse_config(step)?),
        "fill" => ActionKind::Fill(parse_config(step)?),
        "extract" => ActionKind::Extract(parse_config(step)?),
        "extract_to_variable" => ActionKind::ExtractToVariable(parse_config(step)?),
        "wait" => {
            let config: WaitConfig = parse_config(step)?;
            if config.selector.is_none() && config.duration_ms.is_none() {
                return Err(EngineError::InvalidStepConfig {
                    step_id: step.id.clone(),
                    reason: "wait requires `selector` or `duration_ms`".into(),
                });
            }
            ActionKind::Wait(config)
        }
        "screenshot" => ActionKind::Screenshot(parse_config(step)?),
        "scroll" => ActionKind::Scroll(parse_config(step)?),
        "hover" => ActionKind::Hover(parse_config(step)?),
        "press_key" => ActionKind::PressKey(parse_config(step)?),
        "execute_js" => ActionKind::ExecuteJs(parse_config(step)?),
        "set_variable" => ActionKind::SetVariable(parse_config(step)?),
        "download_file" => ActionKind::DownloadFile(parse_config(step)?),
        "drag_drop" => ActionKind::DragDrop(parse_config(step)?),
        "cookie" => ActionKind::Cookie(parse_config(step)?),
        "local_storage" => ActionKind::LocalStorage(parse_config(step)?),
        "select_dropdown" => ActionKind::SelectDropdown(parse_config(step)?),
        other => return Err(EngineError::UnknownStepType(other.to_string())),
    };
    Ok(kind)
}

fn parse_config<T: serde::de::DeserializeOwned>(step: &WorkflowStep) -> Result<T> {
    serde_json::from_value(step.config.clone()).map_err(|err| EngineError::InvalidStepConfig {
        step_id: step.id.clone(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, step_type: &str, config: Value) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            step_type: step_type.to_string(),
            config,
            position: None,
            continue_on_error: false,
        }
    }

    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            steps,
            variables: Default::default(),
        }
    }

    #[test]
    fn compiles_flat_actions_in_order() {
        let program = Program::compile(&definition(vec![
            step("s1", "navigate", json!({"url": "https://example.com"})),
            step("s2", "click", json!({"selector": "#go"})),
        ]))
        .unwrap();
        assert_eq!(program.nodes.len(), 2);
        assert!(matches!(
            &program.nodes[0],
            StepNode::Action(ActionStep {
                kind: ActionKind::Navigate(_),
                ..
            })
        ));
    }

    #[test]
    fn unknown_step_type_is_rejected_with_named_error() {
        let err = Program::compile(&definition(vec![step("s1", "teleport", json!({}))]))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown step type"));
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn malformed_config_names_the_step() {
        let err =
            Program::compile(&definition(vec![step("nav", "navigate", json!({}))])).unwrap_err();
        assert!(err.to_string().contains("nav"));
    }

    #[test]
    fn conditional_nests_both_branches() {
        let program = Program::compile(&definition(vec![step(
            "cond",
            "conditional",
            json!({
                "condition": {"type": "element_exists", "selector": ".banner"},
                "then_steps": [{"id": "t1", "type": "click", "config": {"selector": ".banner"}}],
                "else_steps": [{"id": "e1", "type": "screenshot", "config": {}}],
            }),
        )]))
        .unwrap();
        match &program.nodes[0] {
            StepNode::Conditional {
                then_branch,
                else_branch,
                ..
            } => {
                assert_eq!(then_branch.len(), 1);
                assert_eq!(else_branch.len(), 1);
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn loop_requires_exactly_one_source() {
        let both = step(
            "l1",
            "loop",
            json!({"iterations": 3, "selector": ".row", "steps": []}),
        );
        assert!(Program::compile(&definition(vec![both])).is_err());

        let neither = step("l2", "loop", json!({"steps": []}));
        assert!(Program::compile(&definition(vec![neither])).is_err());
    }

    #[test]
    fn loop_compiles_nested_body() {
        let program = Program::compile(&definition(vec![step(
            "l1",
            "loop",
            json!({
                "selector": ".row",
                "max_iterations": 10,
                "steps": [{"id": "inner", "type": "click", "config": {"selector": ".row"}}],
            }),
        )]))
        .unwrap();
        match &program.nodes[0] {
            StepNode::Loop {
                source,
                max_iterations,
                body,
                ..
            } => {
                assert!(matches!(source, LoopSource::Elements { .. }));
                assert_eq!(*max_iterations, Some(10));
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let err = Program::compile(&definition(vec![
            step("dup", "screenshot", json!({})),
            step("dup", "screenshot", json!({})),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn wait_needs_selector_or_duration() {
        assert!(Program::compile(&definition(vec![step("w", "wait", json!({}))])).is_err());
        assert!(
            Program::compile(&definition(vec![step(
                "w",
                "wait",
                json!({"duration_ms": 250})
            )]))
            .is_ok()
        );
    }
}
