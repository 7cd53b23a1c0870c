use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tiller_core::app::domain::event::{AgentMode, Event, EventKind, SteerKind, TurnFailureReason};
use tiller_core::app::domain::message::Role;
use tiller_core::app::domain::runtime::ActorHandle;
use tiller_core::app::domain::types::{BranchId, SessionId};
use tiller_core::test_utils::{
    ScriptStep, ScriptedProvider, SlowTool, StubGlobTool, in_memory_registry, test_config,
    tool_registry, turn_shape,
};
use tiller_rpc::{AgentService, RpcError, RpcRequest, RpcResponse};
use tiller_tools::{Tool, ToolCall};

const WAIT: Duration = Duration::from_secs(30);

fn service(steps: Vec<ScriptStep>, tools: Vec<Arc<dyn Tool>>) -> AgentService {
    let provider = Arc::new(ScriptedProvider::new(steps));
    let registry = in_memory_registry(provider, tool_registry(tools).unwrap(), test_config());
    AgentService::new(Arc::new(registry))
}

fn live(service: &AgentService, branch_id: BranchId) -> ActorHandle {
    service.registry().actor_process(branch_id).unwrap()
}

async fn settle(service: &AgentService, branch_id: BranchId) {
    let handle = live(service, branch_id);
    assert!(handle.wait_until_quiescent(WAIT).await.is_some());
}

async fn events(service: &AgentService, branch_id: BranchId) -> Vec<Event> {
    service
        .registry()
        .event_log()
        .replay(branch_id, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn file_listing_request_in_build_mode() {
    let service = service(
        vec![
            ScriptStep::tool_call(ToolCall::new("call-1", "glob", json!({"pattern": "*.rs"}))),
            ScriptStep::text("There are two Rust files: src/lib.rs and src/main.rs."),
        ],
        vec![Arc::new(StubGlobTool::default())],
    );

    let created = service
        .create_session(Some("What Rust files are here?".to_string()), Some(AgentMode::Build))
        .await
        .unwrap();
    settle(&service, created.branch_id).await;

    let events = events(&service, created.branch_id).await;
    assert_eq!(
        turn_shape(&events),
        vec![
            "message_appended",
            "tool_call_requested",
            "tool_call_completed",
            "assistant_text_delta",
            "turn_completed",
        ]
    );
    assert!(matches!(
        &events[1].kind,
        EventKind::ToolCallRequested { call, .. } if call.name == "glob"
    ));

    let messages = service
        .list_messages(created.session_id, created.branch_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].mode, AgentMode::Build);
    assert_eq!(messages[1].role, Role::Assistant);
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_a_long_tool_call() {
    let slow = Arc::new(SlowTool::new(Duration::from_secs(5)));
    let service = service(
        vec![
            ScriptStep::tool_call(ToolCall::new("call-1", "slow", json!({}))),
            ScriptStep::text("unreachable"),
        ],
        vec![slow.clone()],
    );

    let created = service
        .create_session(Some("run the slow thing".to_string()), None)
        .await
        .unwrap();
    slow.wait_started().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    service
        .steer(created.branch_id, SteerKind::Interrupt)
        .await
        .unwrap();
    settle(&service, created.branch_id).await;

    assert_eq!(slow.completed(), 1);
    let kinds: Vec<&'static str> = turn_shape(&events(&service, created.branch_id).await);
    assert_eq!(
        kinds,
        vec![
            "message_appended",
            "tool_call_requested",
            "tool_call_completed",
            "steered",
            "turn_failed",
        ]
    );
    let events = events(&service, created.branch_id).await;
    assert!(matches!(
        events.iter().rev().find(|e| e.kind.is_terminal()).map(|e| &e.kind),
        Some(EventKind::TurnFailed {
            reason: TurnFailureReason::Interrupted,
            ..
        })
    ));
}

#[tokio::test]
async fn concurrent_messages_are_serialized_in_submission_order() {
    let service = service(
        vec![ScriptStep::text("first reply"), ScriptStep::text("second reply")],
        Vec::new(),
    );
    let created = service.create_session(None, None).await.unwrap();

    let (first, second) = tokio::join!(
        service.send_message(
            created.session_id,
            created.branch_id,
            "first".to_string(),
            None
        ),
        service.send_message(
            created.session_id,
            created.branch_id,
            "second".to_string(),
            None
        ),
    );
    first.unwrap();
    second.unwrap();
    settle(&service, created.branch_id).await;

    let events = events(&service, created.branch_id).await;
    let completed: Vec<u64> = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::TurnCompleted { turn, .. } => Some(turn),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![1, 2]);

    let messages = service
        .list_messages(created.session_id, created.branch_id)
        .await
        .unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["first", "first reply", "second", "second reply"]
    );
}

#[tokio::test]
async fn unknown_or_foreign_branch_is_a_storage_error() {
    let service = service(Vec::new(), Vec::new());
    let created = service.create_session(None, None).await.unwrap();
    let other = service.create_session(None, None).await.unwrap();

    let err = service
        .send_message(created.session_id, BranchId::new(), "hi".to_string(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Storage { not_found: true, .. }));

    let err = service
        .send_message(created.session_id, other.branch_id, "hi".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    let err = service
        .list_messages(SessionId::new(), created.branch_id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = service
        .send_message(created.session_id, created.branch_id, "  ".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_argument");
}

#[tokio::test]
async fn session_subscription_replays_then_ends_on_delete() {
    let service = service(vec![ScriptStep::text("hello back")], Vec::new());
    let created = service
        .create_session(Some("hello".to_string()), None)
        .await
        .unwrap();
    let mut stream = service
        .subscribe_events(Some(created.session_id))
        .await
        .unwrap();
    settle(&service, created.branch_id).await;

    let first = tokio::time::timeout(WAIT, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.kind.name(), "message_appended");

    service.delete_session(created.session_id).await.unwrap();
    let rest: Vec<Result<Event, RpcError>> = tokio::time::timeout(WAIT, stream.collect())
        .await
        .unwrap();
    let sequences: Vec<u64> = rest.into_iter().map(|e| e.unwrap().sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(sequences.first(), Some(&2));

    assert!(service.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn session_subscription_survives_a_branch_restart() {
    let service = service(
        vec![ScriptStep::text("hello back"), ScriptStep::text("still here")],
        Vec::new(),
    );
    let created = service
        .create_session(Some("hello".to_string()), None)
        .await
        .unwrap();
    let mut stream = service
        .subscribe_events(Some(created.session_id))
        .await
        .unwrap();
    settle(&service, created.branch_id).await;

    let first_turn = events(&service, created.branch_id).await.len();
    for expected in 1..=first_turn as u64 {
        let event = tokio::time::timeout(WAIT, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.sequence, expected);
    }

    service.restart_branch(created.branch_id).await.unwrap();
    service
        .send_message(
            created.session_id,
            created.branch_id,
            "are you there?".to_string(),
            None,
        )
        .await
        .unwrap();
    settle(&service, created.branch_id).await;

    let total = events(&service, created.branch_id).await.len();
    assert!(total > first_turn);
    let mut after_restart = Vec::new();
    for _ in first_turn..total {
        let event = tokio::time::timeout(WAIT, stream.next())
            .await
            .unwrap()
            .expect("subscription ended after restart")
            .unwrap();
        after_restart.push(event);
    }
    assert_eq!(after_restart[0].sequence, first_turn as u64 + 1);
    assert!(after_restart.iter().any(|event| matches!(
        &event.kind,
        EventKind::TurnCompleted { turn: 2, final_message, .. } if final_message == "still here"
    )));
}

#[tokio::test]
async fn global_subscription_sees_every_branch() {
    let service = service(
        vec![ScriptStep::text("one"), ScriptStep::text("two")],
        Vec::new(),
    );
    let mut stream = service.subscribe_events(None).await.unwrap();

    let a = service
        .create_session(Some("a".to_string()), None)
        .await
        .unwrap();
    settle(&service, a.branch_id).await;
    let b = service
        .create_session(Some("b".to_string()), None)
        .await
        .unwrap();
    settle(&service, b.branch_id).await;

    let mut completed = Vec::new();
    while completed.len() < 2 {
        let event = tokio::time::timeout(WAIT, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if event.kind.is_terminal() {
            completed.push(event.branch_id);
        }
    }
    assert_eq!(completed, vec![a.branch_id, b.branch_id]);
}

#[tokio::test]
async fn requests_dispatch_in_wire_form() {
    let service = service(vec![ScriptStep::text("planned")], Vec::new());

    let request: RpcRequest = serde_json::from_value(json!({
        "method": "create_session",
        "first_message": "make a plan",
        "mode": "plan",
    }))
    .unwrap();
    let RpcResponse::SessionCreated(created) = service.handle(request).await.unwrap() else {
        unreachable!("create_session answers with the new ids")
    };
    settle(&service, created.branch_id).await;

    let response = service
        .handle(RpcRequest::ListMessages {
            session_id: created.session_id,
            branch_id: created.branch_id,
        })
        .await
        .unwrap();
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["result"], "messages");
    assert_eq!(value["messages"][1]["content"], "planned");
    assert_eq!(value["messages"][1]["mode"], "plan");

    let err = service
        .handle(RpcRequest::RestartBranch {
            branch_id: BranchId::new(),
        })
        .await
        .unwrap_err();
    let value = serde_json::to_value(&err).unwrap();
    assert_eq!(value["kind"], "storage");

    let response = service
        .handle(RpcRequest::ListSessions)
        .await
        .unwrap();
    assert!(matches!(response, RpcResponse::Sessions { sessions } if sessions.len() == 1));
}
