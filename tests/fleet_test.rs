mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use drover::domain::models::{
    topics, AgentInstance, AgentState, RoleDefinition, TaskOutcome, TaskStatus,
};
use drover::domain::ports::AgentStore;
use drover::infrastructure::providers::{ProviderRegistry, ScriptedProvider};
use drover::services::agent_fleet::{AgentFleet, FleetTiming};
use drover::services::RoleRegistry;
use uuid::Uuid;

use helpers::{board_fixture, wait_for_status, wait_until, BoardFixture};

const FAST_TIMING: FleetTiming = FleetTiming {
    autoscale_interval: Duration::from_millis(100),
    reaper_interval: Duration::from_millis(100),
    stale_after: Duration::from_secs(1),
};

struct FleetFixture {
    fixture: BoardFixture,
    fleet: Arc<AgentFleet>,
    provider: Arc<ScriptedProvider>,
}

/// Build a fleet over the shared board fixture with a scripted provider
/// and fast maintenance cadences.
async fn fleet_fixture(roles: Vec<RoleDefinition>, delay: Duration) -> FleetFixture {
    let fixture = board_fixture().await;
    let registry = Arc::new(RoleRegistry::from_definitions(roles).unwrap());
    // The fleet spawns loops for its own registry; the board keeps the
    // fixture's standard one (a superset) for validation.
    let provider = Arc::new(ScriptedProvider::new("cli").with_delay(delay));
    let providers = Arc::new(
        ProviderRegistry::new("cli")
            .with_provider(Arc::clone(&provider) as Arc<dyn drover::domain::ports::Provider>),
    );
    let fleet = Arc::new(
        AgentFleet::new(
            registry,
            Arc::clone(&fixture.board),
            fixture.agents.clone() as Arc<dyn AgentStore>,
            Arc::clone(&fixture.bus),
            providers,
            None,
        )
        .with_timing(FAST_TIMING),
    );
    FleetFixture {
        fixture,
        fleet,
        provider,
    }
}

fn coder_role(initial: u32, max: u32) -> RoleDefinition {
    let mut coder = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
    coder.initial_instances = initial;
    coder.max_instances = max;
    coder
}

#[tokio::test]
async fn test_startup_recovers_orphans_from_prior_run() {
    let ff = fleet_fixture(vec![coder_role(1, 1)], Duration::from_millis(10)).await;
    let board = &ff.fixture.board;

    // A previous process claimed this task and died without reporting.
    let task = board
        .create_task(ff.fixture.coder_spec("interrupted work"))
        .await
        .unwrap();
    let dead_instance = Uuid::new_v4();
    let claimed = ff.fixture.claim("coder", dead_instance).await;
    assert_eq!(claimed.id, task.id);

    let mut dead_agent = AgentInstance::new("coder");
    dead_agent.instance_id = dead_instance;
    dead_agent.state = AgentState::Busy;
    dead_agent.current_task_id = Some(task.id.clone());
    ff.fixture.agents.insert(&dead_agent).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut recovered = ff.fixture.bus.subscribe(topics::TASK_RECOVERED);

    ff.fleet.start().await;

    let event = tokio::time::timeout(Duration::from_secs(5), recovered.recv())
        .await
        .expect("no recovery event")
        .unwrap();
    assert_eq!(event.payload["task_id"], task.id.as_str());

    // The dead instance is stopped and a fresh loop finishes the task.
    wait_for_status(board, &task.id, TaskStatus::Completed, Duration::from_secs(5)).await;
    let stored = ff.fixture.agents.get(dead_instance).await.unwrap().unwrap();
    assert_eq!(stored.state, AgentState::Stopped);

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_reaper_recovers_stale_instance() {
    let ff = fleet_fixture(vec![coder_role(1, 1)], Duration::from_millis(10)).await;
    ff.fleet.start().await;
    // Keep the live loop away from the bait task.
    ff.fleet.pause(Some("coder")).await;

    let task = ff
        .fixture
        .board
        .create_task(ff.fixture.coder_spec("stalled work"))
        .await
        .unwrap();
    let zombie = Uuid::new_v4();
    ff.fixture.claim("coder", zombie).await;

    let mut zombie_agent = AgentInstance::new("coder");
    zombie_agent.instance_id = zombie;
    zombie_agent.state = AgentState::Busy;
    zombie_agent.current_task_id = Some(task.id.clone());
    zombie_agent.last_heartbeat_at = Utc::now() - ChronoDuration::seconds(10);
    ff.fixture.agents.insert(&zombie_agent).await.unwrap();

    let mut recovered = ff.fixture.bus.subscribe(topics::TASK_RECOVERED);
    let event = tokio::time::timeout(Duration::from_secs(5), recovered.recv())
        .await
        .expect("reaper never fired")
        .unwrap();
    assert_eq!(event.payload["task_id"], task.id.as_str());
    assert_eq!(event.payload["reason"], "heartbeat stale");

    let reverted = ff.fixture.board.get_task(&task.id).await.unwrap();
    assert_eq!(reverted.status, TaskStatus::Pending);
    assert!(reverted.claimed_by.is_none());

    // A living loop picks the recovered task up after resume.
    ff.fleet.resume(Some("coder")).await;
    wait_for_status(
        &ff.fixture.board,
        &task.id,
        TaskStatus::Completed,
        Duration::from_secs(5),
    )
    .await;

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_ten_loops_one_task_single_claim() {
    let ff = fleet_fixture(vec![coder_role(10, 10)], Duration::from_millis(300)).await;
    let mut claims = ff.fixture.bus.subscribe(topics::TASK_CLAIMED);

    ff.fleet.start().await;
    wait_until("all loops to spawn", Duration::from_secs(5), || {
        let fleet = Arc::clone(&ff.fleet);
        async move { fleet.instance_count("coder").await == 10 }
    })
    .await;

    let task = ff
        .fixture
        .board
        .create_task(ff.fixture.coder_spec("contested work"))
        .await
        .unwrap();

    wait_for_status(
        &ff.fixture.board,
        &task.id,
        TaskStatus::Completed,
        Duration::from_secs(5),
    )
    .await;

    // Exactly one of the ten loops won the claim.
    let mut claim_events = 0;
    while let Some(event) = claims.try_recv() {
        if event.payload["task_id"] == task.id.as_str() {
            claim_events += 1;
        }
    }
    assert_eq!(claim_events, 1);

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_autoscale_up_then_down() {
    let mut coder = coder_role(1, 3);
    coder.auto_scale.enabled = true;
    coder.auto_scale.scale_up_threshold = 2;
    coder.auto_scale.scale_down_idle_seconds = 1;
    coder.auto_scale.cooldown_seconds = 0;

    // Slow enough that the queue stays deep while scaling up.
    let ff = fleet_fixture(vec![coder], Duration::from_millis(800)).await;
    ff.fleet.start().await;

    for n in 0..5 {
        ff.fixture
            .board
            .create_task(ff.fixture.coder_spec(&format!("load {n}")))
            .await
            .unwrap();
    }

    wait_until("scale up to max", Duration::from_secs(5), || {
        let fleet = Arc::clone(&ff.fleet);
        async move { fleet.instance_count("coder").await == 3 }
    })
    .await;

    wait_until("queue to drain", Duration::from_secs(15), || {
        let board = Arc::clone(&ff.fixture.board);
        let group_id = ff.fixture.group.id;
        async move { helpers::count_in_status(&board, group_id, TaskStatus::Completed).await == 5 }
    })
    .await;

    wait_until("scale back down", Duration::from_secs(15), || {
        let fleet = Arc::clone(&ff.fleet);
        async move { fleet.instance_count("coder").await == 1 }
    })
    .await;

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_pause_gates_claims_until_resume() {
    let ff = fleet_fixture(vec![coder_role(1, 1)], Duration::from_millis(10)).await;
    ff.fleet.start().await;
    ff.fleet.pause(Some("coder")).await;

    let task = ff
        .fixture
        .board
        .create_task(ff.fixture.coder_spec("held work"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        ff.fixture.board.get_task(&task.id).await.unwrap().status,
        TaskStatus::Pending
    );

    ff.fleet.resume(Some("coder")).await;
    wait_for_status(
        &ff.fixture.board,
        &task.id,
        TaskStatus::Completed,
        Duration::from_secs(5),
    )
    .await;

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_pause_flag_written_to_store_is_observed() {
    let ff = fleet_fixture(vec![coder_role(1, 1)], Duration::from_millis(10)).await;
    ff.fleet.start().await;

    // A separate process wrote the flag; the fleet's maintenance tick
    // picks it up.
    ff.fixture
        .agents
        .set_role_paused("coder", true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let task = ff
        .fixture
        .board
        .create_task(ff.fixture.coder_spec("externally held work"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        ff.fixture.board.get_task(&task.id).await.unwrap().status,
        TaskStatus::Pending
    );

    ff.fixture
        .agents
        .set_role_paused("coder", false)
        .await
        .unwrap();
    wait_for_status(
        &ff.fixture.board,
        &task.id,
        TaskStatus::Completed,
        Duration::from_secs(5),
    )
    .await;

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_transient_provider_errors_retry_in_place() {
    let ff = fleet_fixture(vec![coder_role(1, 1)], Duration::from_millis(10)).await;

    // Two transient faults, then success; the loop's backoff absorbs
    // them without a board-level failure.
    ff.provider.push_transient_error("implementation", "rate limited");
    ff.provider.push_transient_error("implementation", "rate limited");
    ff.provider
        .push_outcome("implementation", TaskOutcome::success_empty());

    let mut failed = ff.fixture.bus.subscribe(topics::TASK_FAILED);
    ff.fleet.start().await;
    let task = ff
        .fixture
        .board
        .create_task(ff.fixture.coder_spec("flaky provider"))
        .await
        .unwrap();

    wait_for_status(
        &ff.fixture.board,
        &task.id,
        TaskStatus::Completed,
        Duration::from_secs(10),
    )
    .await;
    assert!(failed.try_recv().is_none());
    assert_eq!(ff.provider.invocations().len(), 3);

    assert!(ff.fleet.stop(Duration::from_secs(5)).await);
}
