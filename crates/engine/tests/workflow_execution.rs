//! End-to-end runs through the execution engine with a scripted fake
//! browser.

mod common;

use autopilot_engine::engine::ExecutionEngine;
use autopilot_engine::error::EngineError;
use autopilot_engine::types::{
    EngineConfig, ExecutionContext, ExecutionStatus, RunEvent, WorkflowDefinition,
};
use common::{FakeDriver, FakeElement};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn definition(steps: Value) -> WorkflowDefinition {
    serde_json::from_value(json!({ "steps": steps })).expect("definition fixture")
}

fn context(definition: WorkflowDefinition) -> ExecutionContext {
    ExecutionContext::new("exec-1", "wf-1", "user-1", definition)
}

fn collect_events() -> (mpsc::Sender<RunEvent>, JoinHandle<Vec<RunEvent>>) {
    let (tx, mut rx) = mpsc::channel(256);
    let handle = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (tx, handle)
}

#[tokio::test]
async fn runs_steps_in_order_and_extracts_data() {
    let _ = tracing_subscriber::fmt::try_init();
    let driver = FakeDriver::new();
    driver.set_elements(".price", vec![FakeElement::text("42,00 €")]);
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "open", "type": "navigate", "config": {"url": "https://shop.example/item"}},
        {"id": "accept", "type": "click", "config": {"selector": "#accept"}},
        {"id": "price", "type": "extract", "config": {"selector": ".price", "field": "price"}},
    ]));
    let (tx, events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.extracted_data.get("price"), Some(&json!("42,00 €")));
    assert_eq!(
        driver.actions(),
        vec!["navigate:https://shop.example/item", "click:#accept", "close"]
    );

    let events = events.await.unwrap();
    let percentages: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::Progress { percentage, .. } => Some(*percentage),
            _ => None,
        })
        .collect();
    assert_eq!(percentages, vec![33, 67, 100]);
    assert!(matches!(events.last(), Some(RunEvent::Completed { .. })));
}

#[tokio::test]
async fn unknown_step_type_fails_before_any_side_effect() {
    let driver = FakeDriver::new();
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "good", "type": "navigate", "config": {"url": "https://example.com"}},
        {"id": "bad", "type": "teleport", "config": {}},
    ]));
    let (tx, events) = collect_events();
    let err = engine.execute(context(definition), tx).await.unwrap_err();

    assert!(err.to_string().contains("Unknown step type"));
    assert_eq!(driver.sessions_opened(), 0);
    assert!(driver.actions().is_empty());
    let events = events.await.unwrap();
    assert!(matches!(events.as_slice(), [RunEvent::Failed { .. }]));
}

#[tokio::test]
async fn variables_substitute_into_step_configs() {
    let driver = FakeDriver::new();
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "vars", "type": "set_variable", "config": {"name": "user", "value": {"name": "ada"}}},
        {"id": "open", "type": "navigate", "config": {"url": "https://example.com/${user.name}"}},
        {"id": "missing", "type": "navigate", "config": {"url": "https://example.com/${nope}"}},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let actions = driver.actions();
    assert!(actions.contains(&"navigate:https://example.com/ada".to_string()));
    // unresolved references stay verbatim
    assert!(actions.contains(&"navigate:https://example.com/${nope}".to_string()));
}

#[tokio::test]
async fn conditional_takes_the_matching_branch() {
    let driver = FakeDriver::new();
    driver.set_elements(".banner", vec![FakeElement::text("cookie notice")]);
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "dismiss", "type": "conditional", "config": {
            "condition": {"type": "element_exists", "selector": ".banner"},
            "then_steps": [{"id": "t", "type": "click", "config": {"selector": ".banner"}}],
            "else_steps": [{"id": "e", "type": "click", "config": {"selector": ".other"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let actions = driver.actions();
    assert!(actions.contains(&"click:.banner".to_string()));
    assert!(!actions.iter().any(|a| a.contains(".other")));
}

#[tokio::test]
async fn conditional_value_comparison_is_case_insensitive() {
    let driver = FakeDriver::new();
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "vars", "type": "set_variable", "config": {"name": "status", "value": "Ready"}},
        {"id": "gate", "type": "conditional", "config": {
            "condition": {"type": "value_equals", "variable": "status", "operator": "equals", "value": "READY"},
            "then_steps": [{"id": "t", "type": "navigate", "config": {"url": "https://a.example"}}],
            "else_steps": [{"id": "e", "type": "navigate", "config": {"url": "https://b.example"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    engine.execute(context(definition), tx).await.unwrap();

    assert!(driver.actions().contains(&"navigate:https://a.example".to_string()));
}

#[tokio::test]
async fn conditional_fault_evaluates_to_false() {
    let driver = FakeDriver::new();
    // the selector lookup itself errors; the condition must degrade to
    // false instead of failing the run
    driver.fail_selector("#flaky");
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "gate", "type": "conditional", "config": {
            "condition": {"type": "element_exists", "selector": "#flaky"},
            "then_steps": [{"id": "t", "type": "navigate", "config": {"url": "https://a.example"}}],
            "else_steps": [{"id": "e", "type": "navigate", "config": {"url": "https://b.example"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(driver.actions().contains(&"navigate:https://b.example".to_string()));
}

#[tokio::test]
async fn conditional_custom_js_uses_truthiness() {
    let driver = FakeDriver::new();
    driver.set_script_result("window.__ready", json!(1));
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "gate", "type": "conditional", "config": {
            "condition": {"type": "custom_js", "script": "window.__ready"},
            "then_steps": [{"id": "t", "type": "navigate", "config": {"url": "https://a.example"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    engine.execute(context(definition), tx).await.unwrap();

    assert!(driver.actions().contains(&"navigate:https://a.example".to_string()));
}

#[tokio::test]
async fn element_loop_stops_at_max_iterations() {
    let driver = FakeDriver::new();
    driver.set_elements(".row", vec![FakeElement::text("r"); 5]);
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "rows", "type": "loop", "config": {
            "selector": ".row",
            "max_iterations": 3,
            "steps": [{"id": "open", "type": "click", "config": {"selector": ".row-${loop.index}"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(driver.count_actions("click:.row-"), 3);
    assert_eq!(
        driver
            .actions()
            .iter()
            .filter(|a| a.starts_with("click:"))
            .cloned()
            .collect::<Vec<_>>(),
        vec!["click:.row-0", "click:.row-1", "click:.row-2"]
    );
}

#[tokio::test]
async fn element_loop_exhausts_smaller_match_sets() {
    let driver = FakeDriver::new();
    driver.set_elements(".row", vec![FakeElement::text("r"); 2]);
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "rows", "type": "loop", "config": {
            "selector": ".row",
            "max_iterations": 10,
            "steps": [{"id": "open", "type": "click", "config": {"selector": ".row-${loop.index}"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(driver.count_actions("click:.row-"), 2);
}

#[tokio::test]
async fn count_loop_honors_break_condition() {
    let driver = FakeDriver::new();
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "pages", "type": "loop", "config": {
            "iterations": 5,
            "break_if": {"type": "value_equals", "variable": "loop.iteration", "operator": "equals", "value": 2},
            "steps": [{"id": "next", "type": "click", "config": {"selector": ".next"}}],
        }},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(driver.count_actions("click:.next"), 2);
}

#[tokio::test]
async fn best_effort_step_does_not_abort_the_run() {
    let driver = FakeDriver::new();
    driver.fail_selector("#optional");
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "try", "type": "click", "config": {"selector": "#optional"}, "continue_on_error": true},
        {"id": "open", "type": "navigate", "config": {"url": "https://example.com"}},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(driver.actions().contains(&"navigate:https://example.com".to_string()));
}

#[tokio::test]
async fn failing_step_unwinds_with_error_log_and_screenshot() {
    let driver = FakeDriver::new();
    driver.fail_selector("#broken");
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "open", "type": "navigate", "config": {"url": "https://example.com"}},
        {"id": "boom", "type": "click", "config": {"selector": "#broken"}},
        {"id": "after", "type": "navigate", "config": {"url": "https://example.com/after"}},
    ]));
    let (tx, events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.error.as_deref().unwrap_or("").contains("no element matches"));
    assert!(!driver
        .actions()
        .contains(&"navigate:https://example.com/after".to_string()));

    let events = events.await.unwrap();
    let error_log = events.iter().position(|event| {
        matches!(event, RunEvent::Log { level, .. } if *level == autopilot_engine::types::LogLevel::Error)
    });
    let failed_step = events.iter().position(|event| {
        matches!(event, RunEvent::StepCompleted { step_id, result } if step_id == "boom" && !result.success)
    });
    // error log precedes the step's completion event
    assert!(error_log.is_some() && failed_step.is_some());
    assert!(error_log < failed_step);
    let has_screenshot = events.iter().any(|event| {
        matches!(event, RunEvent::StepCompleted { step_id, result } if step_id == "boom" && result.screenshot.is_some())
    });
    assert!(has_screenshot);
    assert!(matches!(events.last(), Some(RunEvent::Failed { .. })));
}

#[tokio::test]
async fn step_timeout_fails_the_run() {
    let driver = FakeDriver::new();
    let engine = ExecutionEngine::new(
        driver.clone_dyn(),
        EngineConfig {
            step_timeout: Duration::from_millis(50),
            screenshot_on_error: false,
            ..EngineConfig::default()
        },
    );

    let definition = definition(json!([
        {"id": "stall", "type": "wait", "config": {"duration_ms": 5000}},
    ]));
    let (tx, _events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.error.as_deref().unwrap_or("").contains("timed out"));
}

#[tokio::test]
async fn assorted_steps_accumulate_extracted_data() {
    let driver = FakeDriver::new();
    driver.set_elements("#form", vec![FakeElement::text("")]);
    driver.set_script_result("document.title", json!("Dashboard"));
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "wait", "type": "wait", "config": {"selector": "#form"}},
        {"id": "cookie-set", "type": "cookie", "config": {"action": "set", "name": "sid", "value": "abc123"}},
        {"id": "cookie-get", "type": "cookie", "config": {"action": "get", "name": "sid", "field": "session"}},
        {"id": "ls-set", "type": "local_storage", "config": {"action": "set", "key": "seen", "value": "yes"}},
        {"id": "ls-get", "type": "local_storage", "config": {"action": "get", "key": "seen", "field": "seen"}},
        {"id": "title", "type": "execute_js", "config": {"script": "document.title", "field": "title"}},
        {"id": "shot", "type": "screenshot", "config": {"full_page": true}},
        {"id": "grab", "type": "download_file", "config": {"url": "https://example.com/report.pdf", "filename": "report.pdf"}},
        {"id": "nudge", "type": "scroll", "config": {"delta_y": 400}},
        {"id": "enter", "type": "press_key", "config": {"key": "Enter", "selector": "#form"}},
        {"id": "pick", "type": "select_dropdown", "config": {"selector": "#lang", "value": "en"}},
    ]));
    let (tx, events) = collect_events();
    let outcome = engine.execute(context(definition), tx).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.extracted_data.get("session"), Some(&json!("abc123")));
    assert_eq!(outcome.extracted_data.get("seen"), Some(&json!("yes")));
    assert_eq!(outcome.extracted_data.get("title"), Some(&json!("Dashboard")));

    let events = events.await.unwrap();
    let download_payload = events.iter().find_map(|event| match event {
        RunEvent::StepCompleted { step_id, result } if step_id == "grab" => result.data.clone(),
        _ => None,
    });
    let payload = download_payload.expect("download step result");
    assert_eq!(payload.get("filename"), Some(&json!("report.pdf")));
    assert!(payload.get("content_base64").is_some());

    let screenshot_event = events.iter().any(|event| {
        matches!(event, RunEvent::StepCompleted { step_id, result } if step_id == "shot" && result.screenshot.is_some())
    });
    assert!(screenshot_event);
}

#[tokio::test]
async fn max_concurrent_one_serializes_runs() {
    let driver = FakeDriver::new();
    driver.set_action_delay(Duration::from_millis(25));
    let engine = Arc::new(ExecutionEngine::new(
        driver.clone_dyn(),
        EngineConfig {
            max_concurrent: 1,
            ..EngineConfig::default()
        },
    ));

    let steps = json!([
        {"id": "open", "type": "navigate", "config": {"url": "https://example.com"}},
    ]);
    let mut handles = Vec::new();
    for index in 0..2 {
        let engine = Arc::clone(&engine);
        let definition = definition(steps.clone());
        handles.push(tokio::spawn(async move {
            let context = ExecutionContext::new(
                format!("exec-{index}"),
                "wf-1",
                "user-1",
                definition,
            );
            let (tx, _rx_task) = mpsc::channel(256);
            engine.execute(context, tx).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
    }
    // the second run never overlapped the first
    assert_eq!(driver.max_open_seen(), 1);
    assert_eq!(driver.sessions_opened(), 2);
}

#[tokio::test]
async fn shutdown_rejects_new_runs() {
    let driver = FakeDriver::new();
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());
    engine.shutdown().await;

    assert_eq!(engine.active_count(), 0);
    let definition = definition(json!([
        {"id": "open", "type": "navigate", "config": {"url": "https://example.com"}},
    ]));
    let (tx, _events) = collect_events();
    let result = engine.execute(context(definition), tx).await;
    assert!(matches!(result, Err(EngineError::EngineClosed)));
    assert_eq!(driver.sessions_opened(), 0);
}

#[tokio::test]
async fn session_allocation_failure_fails_fast() {
    let driver = FakeDriver::new();
    driver.refuse_sessions();
    let engine = ExecutionEngine::new(driver.clone_dyn(), EngineConfig::default());

    let definition = definition(json!([
        {"id": "open", "type": "navigate", "config": {"url": "https://example.com"}},
    ]));
    let (tx, events) = collect_events();
    let result = engine.execute(context(definition), tx).await;

    assert!(matches!(result, Err(EngineError::Session(_))));
    assert_eq!(engine.active_count(), 0);
    assert!(driver.actions().is_empty());
    let events = events.await.unwrap();
    assert!(matches!(events.as_slice(), [RunEvent::Failed { .. }]));
}
