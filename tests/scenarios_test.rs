mod helpers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use drover::domain::models::{
    topics, ProducedTask, RoleDefinition, RoutingRule, TaskOutcome, TaskPriority, TaskStatus,
    TeamSettings,
};
use drover::domain::ports::task_store::TaskFilter;
use drover::infrastructure::providers::{ProviderRegistry, ScriptedProvider};
use drover::services::{Orchestrator, ShutdownOutcome};

use helpers::wait_until;

fn pipeline_roles() -> Vec<RoleDefinition> {
    let mut pm = RoleDefinition::new("pm", "PM", vec!["goal".to_string()]);
    pm.produces = vec!["implementation".to_string()];
    pm.routes_to = vec![RoutingRule {
        role: "coder".to_string(),
        task_types: vec!["implementation".to_string()],
    }];

    let mut coder = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
    coder.produces = vec!["review".to_string()];

    let reviewer = RoleDefinition::new("reviewer", "RV", vec!["review".to_string()]);
    vec![pm, coder, reviewer]
}

struct Harness {
    orchestrator: Orchestrator,
    provider: Arc<ScriptedProvider>,
    _dir: tempfile::TempDir,
}

async fn start_harness(roles: Vec<RoleDefinition>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = TeamSettings {
        database_path: dir
            .path()
            .join("drover.db")
            .to_string_lossy()
            .into_owned(),
        shutdown_grace_secs: 5,
        ..TeamSettings::default()
    };
    let provider = Arc::new(ScriptedProvider::new("cli").with_delay(Duration::from_millis(10)));
    let providers = Arc::new(
        ProviderRegistry::new("cli")
            .with_provider(Arc::clone(&provider) as Arc<dyn drover::domain::ports::Provider>),
    );

    let orchestrator = Orchestrator::start(settings, roles, providers)
        .await
        .unwrap();
    Harness {
        orchestrator,
        provider,
        _dir: dir,
    }
}

fn produced(name: &str, task_type: &str, title: &str) -> ProducedTask {
    ProducedTask {
        name: name.to_string(),
        task_type: task_type.to_string(),
        title: title.to_string(),
        description: "follow-up work".to_string(),
        priority: TaskPriority::Medium,
        blocked_by: Vec::new(),
    }
}

/// Poll until the whole group reaches `completed`, expecting `len`
/// tasks.
async fn wait_group_completed(
    harness: &Harness,
    group_id: uuid::Uuid,
    len: usize,
    deadline: Duration,
) {
    let board = harness.orchestrator.board();
    wait_until("group to finish", deadline, || {
        let board = Arc::clone(&board);
        async move {
            let tasks = board
                .list_tasks(TaskFilter {
                    group_id: Some(group_id),
                    ..TaskFilter::default()
                })
                .await
                .unwrap();
            tasks.len() == len && tasks.iter().all(|t| t.status == TaskStatus::Completed)
        }
    })
    .await;
}

#[tokio::test]
async fn test_single_loop_happy_path() {
    let harness = start_harness(pipeline_roles()).await;
    let mut events = harness.orchestrator.bus().subscribe("task.*");

    // The pm decomposes the goal into one implementation task; the
    // coder finishes it with nothing further to produce.
    harness.provider.push_outcome(
        "goal",
        TaskOutcome::Success {
            summary: Some("split into one task".to_string()),
            produces: vec![produced("impl", "implementation", "do X")],
        },
    );

    let (group_id, root_task_id) = harness
        .orchestrator
        .submit_goal("G", "make it so")
        .await
        .unwrap();
    assert_eq!(root_task_id.as_str(), "PM-001");

    wait_group_completed(&harness, group_id, 2, Duration::from_secs(10)).await;

    let board = harness.orchestrator.board();
    let implementation = board.get_task(&"CD-001".into()).await.unwrap();
    assert_eq!(implementation.parent_id.as_ref().unwrap().as_str(), "PM-001");
    assert_eq!(implementation.depth, 1);

    // Every completion was preceded by a claim of the same task.
    let mut claimed: HashSet<String> = HashSet::new();
    let mut completions = 0;
    while let Some(event) = events.try_recv() {
        let id = event.payload["task_id"].as_str().unwrap_or_default().to_string();
        match event.topic.as_str() {
            topics::TASK_CLAIMED => {
                claimed.insert(id);
            }
            topics::TASK_COMPLETED => {
                completions += 1;
                assert!(claimed.contains(&id), "completion of {id} without claim");
            }
            _ => {}
        }
    }
    assert_eq!(completions, 2);

    let stats = harness.orchestrator.stats().await.unwrap();
    assert_eq!(stats.completed_tasks, 2);
    assert_eq!(stats.in_progress_tasks, 0);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.live_agents, 3); // one loop per role
    assert!(stats.paused_roles.is_empty());

    assert_eq!(
        harness.orchestrator.stop().await.exit_code(),
        ShutdownOutcome::Clean.exit_code()
    );
}

#[tokio::test]
async fn test_rejection_loop_runs_to_terminal_failure() {
    let harness = start_harness(pipeline_roles()).await;
    let provider = &harness.provider;

    // pm fans out one implementation; every implementation round
    // produces a review; the reviewer rejects every round.
    provider.push_outcome(
        "goal",
        TaskOutcome::Success {
            summary: None,
            produces: vec![produced("impl", "implementation", "build feature")],
        },
    );
    for _ in 0..3 {
        provider.push_outcome(
            "implementation",
            TaskOutcome::Success {
                summary: None,
                produces: vec![produced("check", "review", "review feature")],
            },
        );
        provider.push_outcome(
            "review",
            TaskOutcome::Reject {
                reason: "does not satisfy the feature".to_string(),
                back_to_role: "coder".to_string(),
            },
        );
    }

    let (group_id, _) = harness
        .orchestrator
        .submit_goal("Feature", "with review")
        .await
        .unwrap();

    let board = harness.orchestrator.board();
    // The third rejection creates CD-004 terminal-failed and ends the
    // cycle; afterwards the group holds no live work.
    wait_until("rejection chain to exhaust", Duration::from_secs(15), || {
        let board = Arc::clone(&board);
        async move {
            board
                .get_task(&"CD-004".into())
                .await
                .map(|t| t.status == TaskStatus::Failed)
                .unwrap_or(false)
        }
    })
    .await;

    let cd4 = board.get_task(&"CD-004".into()).await.unwrap();
    assert_eq!(
        cd4.failure_reason.as_deref(),
        Some("rejection cycle limit exceeded")
    );
    assert!(board.get_task(&"CD-005".into()).await.is_err());

    wait_until("group to quiesce", Duration::from_secs(10), || {
        let board = Arc::clone(&board);
        async move {
            board
                .list_tasks(TaskFilter {
                    group_id: Some(group_id),
                    ..TaskFilter::default()
                })
                .await
                .unwrap()
                .iter()
                .all(|t| t.status.is_terminal())
        }
    })
    .await;

    // Three reviews ran, all rejected.
    let reviews = board
        .list_tasks(TaskFilter {
            group_id: Some(group_id),
            assigned_to: Some("reviewer".to_string()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(reviews.len(), 3);
    assert!(reviews.iter().all(|t| t.status == TaskStatus::Rejected));

    assert_eq!(harness.orchestrator.stop().await.exit_code(), 0);
}

#[tokio::test]
async fn test_router_creates_sibling_dependencies_atomically() {
    let harness = start_harness(pipeline_roles()).await;

    // The goal decomposes into implement → verify, linked by local name.
    let mut verify = produced("verify", "implementation", "verify X");
    verify.blocked_by = vec!["impl".to_string()];
    harness.provider.push_outcome(
        "goal",
        TaskOutcome::Success {
            summary: None,
            produces: vec![verify, produced("impl", "implementation", "do X")],
        },
    );

    let (group_id, _) = harness
        .orchestrator
        .submit_goal("Chained", "two steps")
        .await
        .unwrap();

    wait_group_completed(&harness, group_id, 3, Duration::from_secs(10)).await;

    // The dependent child carried a real dependency edge on its
    // sibling, created in the same pass.
    let board = harness.orchestrator.board();
    let tasks = board
        .list_tasks(TaskFilter {
            group_id: Some(group_id),
            assigned_to: Some("coder".to_string()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    let verify_task = tasks.iter().find(|t| t.title == "verify X").unwrap();
    let impl_task = tasks.iter().find(|t| t.title == "do X").unwrap();
    assert_eq!(verify_task.blocked_by, vec![impl_task.id.clone()]);

    assert_eq!(harness.orchestrator.stop().await.exit_code(), 0);
}

#[tokio::test]
async fn test_unknown_produced_type_is_dropped() {
    let harness = start_harness(pipeline_roles()).await;
    let mut dropped = harness.orchestrator.bus().subscribe(topics::ROUTER_DROPPED);

    harness.provider.push_outcome(
        "goal",
        TaskOutcome::Success {
            summary: None,
            produces: vec![
                produced("impl", "implementation", "do X"),
                produced("ship", "deployment", "ship X"),
            ],
        },
    );

    let (group_id, _) = harness
        .orchestrator
        .submit_goal("Partial", "one target unknown")
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), dropped.recv())
        .await
        .expect("no router.dropped event")
        .unwrap();
    assert_eq!(event.payload["task_type"], "deployment");

    wait_group_completed(&harness, group_id, 2, Duration::from_secs(10)).await;

    assert_eq!(harness.orchestrator.stop().await.exit_code(), 0);
}
