// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generation-level tests for the orchestrator loop.
//!
//! Uses [`ScriptedMockClient`] so every scenario is deterministic and
//! requires no network access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tove_model::{
    adapter::to_provider_contents, ChatMessage, Content, GenEvent, MockTurn, Part,
    ScriptedMockClient,
};
use tove_tools::{MemoryStore, ResultCompactor, Tool, ToolRegistry, ToolResult};

use crate::{Orchestrator, RunConfig, StreamEvent};

// ── Helpers ───────────────────────────────────────────────────────────────────

struct StaticTool {
    name: &'static str,
    reply: &'static str,
    delay: Duration,
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "static test tool"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": { "filename": { "type": "string" } } })
    }
    async fn execute(&self, call_id: &str, _args: &Value) -> ToolResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        ToolResult::ok(call_id, self.reply)
    }
}

fn registry_with(tools: Vec<StaticTool>) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    for t in tools {
        reg.register(t).unwrap();
    }
    reg
}

fn orchestrator(client: Arc<ScriptedMockClient>, registry: ToolRegistry) -> Orchestrator {
    Orchestrator::new(
        client,
        Arc::new(registry),
        Arc::new(ResultCompactor::new(Arc::new(MemoryStore::new()))),
    )
}

fn fn_call_turn(name: &str, args: Value) -> MockTurn {
    MockTurn::Events(vec![
        GenEvent::FunctionCall {
            name: name.into(),
            args,
            thought_signature: None,
        },
        GenEvent::Done { usage: None },
    ])
}

fn text_turn(text: &str) -> MockTurn {
    MockTurn::Events(vec![
        GenEvent::TextDelta(text.into()),
        GenEvent::Done { usage: None },
    ])
}

fn user_contents(text: &str) -> Vec<Content> {
    to_provider_contents(&[ChatMessage::user(text)])
}

async fn run_and_collect(
    orch: &Orchestrator,
    cfg: RunConfig,
    contents: Vec<Content>,
    cancel: CancellationToken,
) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    let run = orch.run(cfg, contents, cancel, tx);
    let collect = async {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    };
    let ((), events) = tokio::join!(run, collect);
    events
}

fn tool_starts(events: &[StreamEvent]) -> Vec<(&str, &str)> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolStart { call_id, name, .. } => Some((call_id.as_str(), name.as_str())),
            _ => None,
        })
        .collect()
}

fn tool_ends(events: &[StreamEvent]) -> Vec<(&str, &str)> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolEnd { call_id, name, .. } => Some((call_id.as_str(), name.as_str())),
            _ => None,
        })
        .collect()
}

fn done_message(events: &[StreamEvent]) -> Option<&ChatMessage> {
    events.iter().find_map(|e| match e {
        StreamEvent::Done { message, .. } => Some(message),
        _ => None,
    })
}

// ── Echo without tools ────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_without_tools_streams_then_completes() {
    let client = Arc::new(ScriptedMockClient::always_text("hello"));
    let orch = orchestrator(client.clone(), ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("hi"),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "hello"));
    let done = done_message(&events).expect("done event");
    assert_eq!(done.content, "hello");
    assert!(
        matches!(events.last(), Some(StreamEvent::Done { .. })),
        "done must be the final event"
    );
}

#[tokio::test]
async fn done_without_tool_calls_omits_the_record_list() {
    let client = Arc::new(ScriptedMockClient::always_text("x"));
    let orch = orchestrator(client, ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("hi"),
        CancellationToken::new(),
    )
    .await;
    match events.last() {
        Some(StreamEvent::Done { tool_calls, .. }) => assert!(tool_calls.is_none()),
        other => panic!("expected done, got {other:?}"),
    }
}

// ── Single tool round ─────────────────────────────────────────────────────────

#[tokio::test]
async fn single_tool_round_orders_events_correctly() {
    let client = Arc::new(ScriptedMockClient::tool_then_text(
        "read_file",
        json!({"filename": "SOUL.md"}),
        "Soul content.",
    ));
    let registry = registry_with(vec![StaticTool {
        name: "read_file",
        reply: "Soul",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client.clone(), registry);
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("read your soul file"),
        CancellationToken::new(),
    )
    .await;

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolEnd { .. } => "tool_end",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::Done { .. } => "done",
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(kinds, vec!["tool_start", "tool_end", "text_delta", "done"]);

    let done = events.last().unwrap();
    match done {
        StreamEvent::Done { message, tool_calls } => {
            assert_eq!(message.content, "Soul content.");
            let calls = tool_calls.as_ref().expect("tool calls recorded");
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "read_file");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn tool_results_feed_back_as_function_responses() {
    let client = Arc::new(ScriptedMockClient::tool_then_text(
        "read_file",
        json!({"filename": "SOUL.md"}),
        "done",
    ));
    let registry = registry_with(vec![StaticTool {
        name: "read_file",
        reply: "Soul",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client.clone(), registry);
    let _ = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("go"),
        CancellationToken::new(),
    )
    .await;

    let requests = client.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    // Second request: model functionCall turn, then user functionResponse turn.
    let second = &requests[1];
    let model_turn = &second.contents[second.contents.len() - 2];
    assert!(matches!(model_turn.parts[0], Part::FunctionCall { .. }));
    let response_turn = second.contents.last().unwrap();
    match &response_turn.parts[0] {
        Part::FunctionResponse { function_response } => {
            assert_eq!(function_response.name, "read_file");
            assert_eq!(function_response.response["output"], "Soul");
        }
        other => panic!("expected functionResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_registry_disables_tools_entirely() {
    let client = Arc::new(ScriptedMockClient::tool_then_text(
        "missing_tool",
        json!({}),
        "recovered",
    ));
    let orch = orchestrator(client.clone(), ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("go"),
        CancellationToken::new(),
    )
    .await;

    // With no registered tools the turn runs tool-free; a stray call from
    // the model is dropped and the turn completes as text-only.
    assert!(tool_starts(&events).is_empty());
    assert!(done_message(&events).is_some());
}

#[tokio::test]
async fn unknown_tool_name_becomes_error_result() {
    let client = Arc::new(ScriptedMockClient::tool_then_text(
        "vanished",
        json!({}),
        "recovered",
    ));
    // Non-empty registry so tools stay enabled, but the called name is absent.
    let registry = registry_with(vec![StaticTool {
        name: "read_file",
        reply: "x",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client.clone(), registry);
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("go"),
        CancellationToken::new(),
    )
    .await;

    let end = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolEnd { result, .. } => Some(result.clone()),
            _ => None,
        })
        .expect("tool_end for unknown tool");
    assert!(end.is_error());
    assert!(end.text().contains("unknown tool"));
    assert_eq!(done_message(&events).unwrap().content, "recovered");
}

// ── Iteration cap & synthesis ─────────────────────────────────────────────────

#[tokio::test]
async fn iteration_cap_triggers_final_synthesis() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        fn_call_turn("read_file", json!({"filename": "a"})),
        fn_call_turn("read_file", json!({"filename": "b"})),
        text_turn("Summary."),
    ]));
    let registry = registry_with(vec![StaticTool {
        name: "read_file",
        reply: "data",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client.clone(), registry);
    let cfg = RunConfig {
        max_iterations: 2,
        soft_limit: 1,
        ..RunConfig::default()
    };
    let events = run_and_collect(&orch, cfg, user_contents("dig in"), CancellationToken::new())
        .await;

    assert_eq!(tool_starts(&events).len(), 2);
    assert_eq!(tool_ends(&events).len(), 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::TextDelta { delta } if delta == "Summary.")));
    assert_eq!(done_message(&events).unwrap().content, "Summary.");

    // The synthesis call carries no tool declarations and the budget notice.
    let requests = client.requests.lock().unwrap();
    let last = requests.last().unwrap();
    assert!(last.tools.is_empty());
    assert!(last
        .system_instruction
        .as_deref()
        .unwrap()
        .contains("no rounds remaining"));
}

#[tokio::test]
async fn soft_limit_appends_budget_notice() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        fn_call_turn("probe", json!({})),
        fn_call_turn("probe", json!({})),
        text_turn("ok"),
    ]));
    let registry = registry_with(vec![StaticTool {
        name: "probe",
        reply: "pong",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client.clone(), registry);
    let cfg = RunConfig {
        max_iterations: 8,
        soft_limit: 1,
        ..RunConfig::default()
    };
    let _ = run_and_collect(&orch, cfg, user_contents("go"), CancellationToken::new()).await;

    let requests = client.requests.lock().unwrap();
    // Request 0: no notice.  Request 1 (iteration 1 ≥ soft limit): notice.
    assert!(!requests[0]
        .system_instruction
        .as_deref()
        .unwrap()
        .contains("Tool Budget"));
    let augmented = requests[1].system_instruction.as_deref().unwrap();
    assert!(augmented.contains("Tool Budget: 7 rounds remaining"));
    assert!(augmented.contains("tool=probe count=1"));
}

#[tokio::test]
async fn bounded_rounds_with_relentless_tool_caller() {
    // The model asks for a tool every single round; the loop must still
    // terminate with exactly one done, last.
    let turns: Vec<MockTurn> = (0..20).map(|_| fn_call_turn("probe", json!({}))).collect();
    let client = Arc::new(ScriptedMockClient::new(turns));
    let registry = registry_with(vec![StaticTool {
        name: "probe",
        reply: "pong",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client, registry);
    let cfg = RunConfig {
        max_iterations: 4,
        soft_limit: 3,
        ..RunConfig::default()
    };
    let events = run_and_collect(&orch, cfg, user_contents("loop"), CancellationToken::new())
        .await;

    let dones = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Done { .. }))
        .count();
    assert_eq!(dones, 1, "exactly one done event");
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    assert_eq!(tool_starts(&events).len(), 4, "one round per iteration");

    // Every tool_start has exactly one matching tool_end, start first.
    let starts = tool_starts(&events);
    let ends = tool_ends(&events);
    assert_eq!(starts.len(), ends.len());
    for (call_id, _) in &starts {
        let start_pos = events.iter().position(|e| {
            matches!(e, StreamEvent::ToolStart { call_id: c, .. } if c == call_id)
        });
        let end_pos = events.iter().position(|e| {
            matches!(e, StreamEvent::ToolEnd { call_id: c, .. } if c == call_id)
        });
        assert!(start_pos.unwrap() < end_pos.unwrap());
    }
}

// ── Parallel tool execution ───────────────────────────────────────────────────

#[tokio::test]
async fn parallel_calls_in_one_round_all_complete() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        MockTurn::Events(vec![
            GenEvent::FunctionCall {
                name: "alpha".into(),
                args: json!({}),
                thought_signature: None,
            },
            GenEvent::FunctionCall {
                name: "beta".into(),
                args: json!({}),
                thought_signature: None,
            },
            GenEvent::Done { usage: None },
        ]),
        text_turn("both done"),
    ]));
    let registry = registry_with(vec![
        StaticTool {
            name: "alpha",
            reply: "A",
            delay: Duration::from_millis(20),
        },
        StaticTool {
            name: "beta",
            reply: "B",
            delay: Duration::from_millis(5),
        },
    ]);
    let orch = orchestrator(client.clone(), registry);
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("fan out"),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(tool_starts(&events).len(), 2);
    assert_eq!(tool_ends(&events).len(), 2);
    // Results are delivered in request order regardless of completion order.
    let requests = client.requests.lock().unwrap();
    let responses = requests[1].contents.last().unwrap();
    match (&responses.parts[0], &responses.parts[1]) {
        (
            Part::FunctionResponse { function_response: a },
            Part::FunctionResponse { function_response: b },
        ) => {
            assert_eq!(a.name, "alpha");
            assert_eq!(b.name, "beta");
        }
        other => panic!("expected two functionResponses, got {other:?}"),
    }
}

// ── thoughtSignature echo ─────────────────────────────────────────────────────

#[tokio::test]
async fn thought_signature_is_preserved_on_the_model_turn() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        MockTurn::Events(vec![
            GenEvent::FunctionCall {
                name: "probe".into(),
                args: json!({}),
                thought_signature: Some("sig-abc".into()),
            },
            GenEvent::Done { usage: None },
        ]),
        text_turn("ok"),
    ]));
    let registry = registry_with(vec![StaticTool {
        name: "probe",
        reply: "pong",
        delay: Duration::ZERO,
    }]);
    let orch = orchestrator(client.clone(), registry);
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("go"),
        CancellationToken::new(),
    )
    .await;

    // Echoed on the wire...
    let requests = client.requests.lock().unwrap();
    let model_turn = &requests[1].contents[requests[1].contents.len() - 2];
    match &model_turn.parts[0] {
        Part::FunctionCall {
            thought_signature, ..
        } => assert_eq!(thought_signature.as_deref(), Some("sig-abc")),
        other => panic!("expected functionCall, got {other:?}"),
    }
    // ...and surfaced on the tool_start event.
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::ToolStart { thought_signature: Some(s), .. } if s == "sig-abc"
    )));
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_mid_tool_ends_with_cancelled_error() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        fn_call_turn("slow_tool", json!({})),
        text_turn("never reached"),
    ]));
    let registry = registry_with(vec![StaticTool {
        name: "slow_tool",
        reply: "late",
        delay: Duration::from_secs(10),
    }]);
    let orch = orchestrator(client, registry);
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trip.cancel();
    });

    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("take your time"),
        cancel,
    )
    .await;

    assert_eq!(tool_starts(&events).len(), 1);
    let ends = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolEnd { result, .. } => Some(result.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].error.as_deref(), Some("cancelled"));
    assert!(
        matches!(events.last(), Some(StreamEvent::Error { message }) if message == "cancelled"),
        "error(cancelled) must be the last event: {events:?}"
    );
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done { .. })));
}

#[tokio::test]
async fn pre_cancelled_run_emits_only_the_error() {
    let client = Arc::new(ScriptedMockClient::always_text("unused"));
    let orch = orchestrator(client, ToolRegistry::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let events =
        run_and_collect(&orch, RunConfig::default(), user_contents("hi"), cancel).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error { message } if message == "cancelled"));
}

// ── Provider failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn context_overflow_is_swallowed_into_done() {
    let client = Arc::new(ScriptedMockClient::new(vec![MockTurn::Fail {
        status: 400,
        body: "context length exceeded".into(),
    }]));
    let orch = orchestrator(client, ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("hi"),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
}

#[tokio::test]
async fn permanent_provider_failure_surfaces_as_error() {
    let client = Arc::new(ScriptedMockClient::new(vec![MockTurn::Fail {
        status: 401,
        body: "unauthorized".into(),
    }]));
    let orch = orchestrator(client, ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("hi"),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { message } => assert!(message.contains("401")),
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn transient_provider_failure_is_retried() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        MockTurn::Fail {
            status: 503,
            body: "service unavailable".into(),
        },
        text_turn("recovered"),
    ]));
    let orch = orchestrator(client.clone(), ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("hi"),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(done_message(&events).unwrap().content, "recovered");
    assert_eq!(client.requests.lock().unwrap().len(), 2);
}

// ── Reasoning-tag sanitization ────────────────────────────────────────────────

#[tokio::test]
async fn think_blocks_are_stripped_from_the_persisted_message() {
    let client = Arc::new(ScriptedMockClient::new(vec![MockTurn::Events(vec![
        GenEvent::TextDelta("<think>secret reasoning</think>".into()),
        GenEvent::TextDelta("The answer is 4.".into()),
        GenEvent::Done { usage: None },
    ])]));
    let orch = orchestrator(client, ToolRegistry::new());
    let events = run_and_collect(
        &orch,
        RunConfig::default(),
        user_contents("2+2?"),
        CancellationToken::new(),
    )
    .await;

    let done = done_message(&events).unwrap();
    assert_eq!(done.content, "The answer is 4.");
}
