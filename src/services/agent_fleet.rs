//! The agent fleet: owner of every agent loop.
//!
//! Spawns and retires loops per role, autoscales on queue depth, reaps
//! instances with stale heartbeats, and carries pause/resume flags.
//! Supervisor errors are logged and retried on the next tick; they
//! never take the fleet down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::{topics, AgentState, RoleDefinition, HEARTBEAT_STALE_SECS};
use crate::domain::ports::AgentStore;
use crate::infrastructure::providers::ProviderRegistry;
use crate::services::agent_loop::AgentLoop;
use crate::services::event_bus::EventBus;
use crate::services::role_registry::RoleRegistry;
use crate::services::task_board::TaskBoard;

/// Maintenance cadences. Defaults match production behavior; tests
/// tighten them.
#[derive(Debug, Clone, Copy)]
pub struct FleetTiming {
    /// Autoscaler cadence.
    pub autoscale_interval: Duration,
    /// Heartbeat reaper cadence.
    pub reaper_interval: Duration,
    /// Heartbeat silence after which an instance is reaped.
    pub stale_after: Duration,
}

impl Default for FleetTiming {
    fn default() -> Self {
        Self {
            autoscale_interval: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(HEARTBEAT_STALE_SECS as u64),
        }
    }
}

struct LoopHandle {
    instance_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RoleFleet {
    definition: Arc<RoleDefinition>,
    pause_tx: watch::Sender<bool>,
    loops: Vec<LoopHandle>,
    last_scale_at: Option<Instant>,
    idle_since: Option<Instant>,
}

impl RoleFleet {
    fn prune_finished(&mut self) {
        self.loops.retain(|entry| !entry.handle.is_finished());
    }

    fn cooldown_over(&self, now: Instant) -> bool {
        self.last_scale_at.map_or(true, |last| {
            now.duration_since(last).as_secs() >= self.definition.auto_scale.cooldown_seconds
        })
    }
}

struct FleetState {
    roles: HashMap<String, RoleFleet>,
    maintenance: Vec<JoinHandle<()>>,
}

pub struct AgentFleet {
    registry: Arc<RoleRegistry>,
    board: Arc<TaskBoard>,
    agents: Arc<dyn AgentStore>,
    bus: Arc<EventBus>,
    providers: Arc<ProviderRegistry>,
    default_model: Option<String>,
    timing: FleetTiming,
    state: Mutex<FleetState>,
    cancel: CancellationToken,
    /// Stops the autoscaler/reaper/flag-sync ahead of the loops so the
    /// shutdown drain is not raced by a flag re-sync.
    maintenance_cancel: CancellationToken,
}

impl AgentFleet {
    pub fn new(
        registry: Arc<RoleRegistry>,
        board: Arc<TaskBoard>,
        agents: Arc<dyn AgentStore>,
        bus: Arc<EventBus>,
        providers: Arc<ProviderRegistry>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            registry,
            board,
            agents,
            bus,
            providers,
            default_model,
            timing: FleetTiming::default(),
            state: Mutex::new(FleetState {
                roles: HashMap::new(),
                maintenance: Vec::new(),
            }),
            cancel: CancellationToken::new(),
            maintenance_cancel: CancellationToken::new(),
        }
    }

    pub fn with_timing(mut self, timing: FleetTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Recover orphans from a prior run, spawn the initial loops, apply
    /// persisted pause flags, and start the autoscaler and heartbeat
    /// reaper.
    pub async fn start(self: &Arc<Self>) {
        self.recover_orphans().await;

        let paused = self.agents.paused_roles().await.unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to read pause flags");
            Vec::new()
        });

        {
            let mut state = self.state.lock().await;
            for definition in self.registry.roles() {
                let (pause_tx, _) = watch::channel(false);
                let mut fleet = RoleFleet {
                    definition: Arc::clone(&definition),
                    pause_tx,
                    loops: Vec::new(),
                    last_scale_at: None,
                    idle_since: None,
                };
                let initial =
                    definition.initial_instances.min(definition.max_instances).max(1);
                for _ in 0..initial {
                    self.spawn_loop(&mut fleet);
                }
                state.roles.insert(definition.role.clone(), fleet);
            }

            // Pause flags survive restarts.
            for name in &paused {
                if let Some(fleet) = state.roles.get(name) {
                    let _ = fleet.pause_tx.send(true);
                    tracing::info!(role = %name, "role starts paused");
                }
            }

            let autoscaler = {
                let fleet = Arc::clone(self);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(fleet.timing.autoscale_interval);
                    loop {
                        tokio::select! {
                            () = fleet.maintenance_cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                fleet.sync_pause_flags().await;
                                fleet.autoscale_tick().await;
                            }
                        }
                    }
                })
            };
            let reaper = {
                let fleet = Arc::clone(self);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(fleet.timing.reaper_interval);
                    loop {
                        tokio::select! {
                            () = fleet.maintenance_cancel.cancelled() => break,
                            _ = ticker.tick() => fleet.reaper_tick().await,
                        }
                    }
                })
            };
            state.maintenance.push(autoscaler);
            state.maintenance.push(reaper);
        }

        tracing::info!("agent fleet started");
    }

    /// Reset work claimed by instances of a previous process.
    async fn recover_orphans(&self) {
        let agents = match self.agents.list().await {
            Ok(agents) => agents,
            Err(err) => {
                tracing::error!(error = %err, "orphan scan failed");
                return;
            }
        };
        for agent in agents.into_iter().filter(|a| a.state.is_live()) {
            tracing::warn!(
                instance_id = %agent.instance_id,
                role = %agent.role,
                "recovering orphaned agent instance"
            );
            if let Err(err) = self
                .board
                .recover_instance(agent.instance_id, Utc::now(), "orphaned by restart")
                .await
            {
                tracing::error!(error = %err, "orphan task recovery failed");
            }
            if let Err(err) = self.agents.mark_stopped(agent.instance_id).await {
                tracing::error!(error = %err, "failed to stop orphaned instance");
            }
        }
    }

    fn spawn_loop(&self, fleet: &mut RoleFleet) {
        let definition = Arc::clone(&fleet.definition);
        let provider = match self.providers.for_role(&definition) {
            Ok(provider) => provider,
            Err(err) => {
                tracing::error!(role = %definition.role, error = %err, "no provider; loop not spawned");
                return;
            }
        };

        let instance_id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        let agent_loop = AgentLoop::new(
            instance_id,
            definition,
            Arc::clone(&self.board),
            Arc::clone(&self.agents),
            Arc::clone(&self.bus),
            provider,
            self.default_model.clone(),
            fleet.pause_tx.subscribe(),
            cancel.clone(),
        );
        let handle = tokio::spawn(agent_loop.run());
        fleet.loops.push(LoopHandle {
            instance_id,
            cancel,
            handle,
        });
    }

    /// One autoscaler pass over every autoscaling role.
    async fn autoscale_tick(&self) {
        for definition in self.registry.roles() {
            if !definition.auto_scale.enabled {
                continue;
            }
            if let Err(err) = self.autoscale_role(&definition).await {
                tracing::error!(role = %definition.role, error = %err, "autoscale tick failed");
            }
        }
    }

    async fn autoscale_role(
        &self,
        definition: &Arc<RoleDefinition>,
    ) -> crate::domain::errors::DomainResult<()> {
        let pending = self.board.pending_count(&definition.role).await?;
        let instances_by_state = self.agents.list_by_role(&definition.role).await?;

        let mut state = self.state.lock().await;
        let Some(fleet) = state.roles.get_mut(&definition.role) else {
            return Ok(());
        };
        fleet.prune_finished();
        let now = Instant::now();
        let count = fleet.loops.len();

        let any_busy = fleet.loops.iter().any(|entry| {
            instances_by_state
                .iter()
                .find(|a| a.instance_id == entry.instance_id)
                .is_some_and(|a| a.state == AgentState::Busy)
        });

        if pending > definition.auto_scale.scale_up_threshold
            && (count as u32) < definition.max_instances
            && fleet.cooldown_over(now)
        {
            tracing::info!(
                role = %definition.role,
                pending,
                instances = count,
                "scaling up"
            );
            self.spawn_loop(fleet);
            fleet.last_scale_at = Some(now);
            fleet.idle_since = None;
            return Ok(());
        }

        // Scale down only after the whole role has idled long enough.
        if any_busy || pending > 0 {
            fleet.idle_since = None;
            return Ok(());
        }
        let idle_since = *fleet.idle_since.get_or_insert(now);
        let idle_for = now.duration_since(idle_since).as_secs();
        if count > 1
            && idle_for >= definition.auto_scale.scale_down_idle_seconds
            && fleet.cooldown_over(now)
        {
            if let Some(entry) = fleet.loops.pop() {
                tracing::info!(
                    role = %definition.role,
                    instance_id = %entry.instance_id,
                    idle_for,
                    "scaling down"
                );
                entry.cancel.cancel();
            }
            fleet.last_scale_at = Some(now);
            fleet.idle_since = Some(now);
        }
        Ok(())
    }

    /// One heartbeat-reaper pass: stop silent instances and put their
    /// work back on the queue.
    async fn reaper_tick(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.timing.stale_after.as_secs() as i64);
        let stale = match self.agents.list_stale(cutoff).await {
            Ok(stale) => stale,
            Err(err) => {
                tracing::error!(error = %err, "stale agent scan failed");
                return;
            }
        };

        for agent in stale {
            tracing::warn!(
                instance_id = %agent.instance_id,
                role = %agent.role,
                last_heartbeat = %agent.last_heartbeat_at,
                "reaping stale agent"
            );
            if let Err(err) = self.agents.mark_stopped(agent.instance_id).await {
                tracing::error!(error = %err, "failed to stop stale instance");
                continue;
            }
            self.bus.publish_json(
                topics::AGENT_STATUS_CHANGED,
                json!({
                    "instance_id": agent.instance_id,
                    "role": agent.role,
                    "state": AgentState::Stopped.as_str(),
                    "reason": "heartbeat stale",
                }),
            );
            if let Err(err) = self
                .board
                .recover_instance(agent.instance_id, Utc::now(), "heartbeat stale")
                .await
            {
                tracing::error!(error = %err, "stale task recovery failed");
            }

            // If the zombie loop is ours, make sure it stops competing.
            let mut state = self.state.lock().await;
            if let Some(fleet) = state.roles.get_mut(&agent.role) {
                if let Some(pos) = fleet
                    .loops
                    .iter()
                    .position(|entry| entry.instance_id == agent.instance_id)
                {
                    let entry = fleet.loops.remove(pos);
                    entry.cancel.cancel();
                }
            }
        }
    }

    /// Pause one role or all of them. Loops finish their current task
    /// first and then idle. The flag is persisted so it survives
    /// restarts and a separate CLI process can set it.
    pub async fn pause(&self, role: Option<&str>) {
        self.persist_pause(role, true).await;
        self.apply_pause(role, true).await;
    }

    pub async fn resume(&self, role: Option<&str>) {
        self.persist_pause(role, false).await;
        self.apply_pause(role, false).await;
    }

    async fn persist_pause(&self, role: Option<&str>, paused: bool) {
        let targets: Vec<String> = match role {
            Some(role) => vec![role.to_string()],
            None => self.registry.roles().map(|d| d.role.clone()).collect(),
        };
        for name in targets {
            if let Err(err) = self.agents.set_role_paused(&name, paused).await {
                tracing::error!(role = %name, error = %err, "failed to persist pause flag");
            }
        }
    }

    /// Flip the in-process watch flags only. The shutdown drain uses
    /// this directly so it never persists a pause.
    async fn apply_pause(&self, role: Option<&str>, paused: bool) {
        let state = self.state.lock().await;
        for (name, fleet) in &state.roles {
            if role.is_none() || role == Some(name.as_str()) {
                let _ = fleet.pause_tx.send(paused);
                tracing::info!(role = %name, paused, "role pause flag set");
            }
        }
    }

    /// Reconcile the watch flags with the persisted flags, picking up
    /// pauses written by other processes.
    async fn sync_pause_flags(&self) {
        let paused: std::collections::HashSet<String> = match self.agents.paused_roles().await {
            Ok(roles) => roles.into_iter().collect(),
            Err(err) => {
                tracing::error!(error = %err, "pause flag scan failed");
                return;
            }
        };
        let state = self.state.lock().await;
        for (name, fleet) in &state.roles {
            let want = paused.contains(name);
            if *fleet.pause_tx.borrow() != want {
                let _ = fleet.pause_tx.send(want);
                tracing::info!(role = %name, paused = want, "pause flag synced from store");
            }
        }
    }

    /// Live loop count for a role.
    pub async fn instance_count(&self, role: &str) -> usize {
        let mut state = self.state.lock().await;
        state.roles.get_mut(role).map_or(0, |fleet| {
            fleet.prune_finished();
            fleet.loops.len()
        })
    }

    /// Graceful stop: pause everything, drain in-flight work up to the
    /// deadline, then cancel whatever is left. Returns whether the
    /// drain finished in time.
    pub async fn stop(&self, grace: Duration) -> bool {
        // Maintenance goes first so the flag sync cannot un-pause the
        // drain; the drain pause itself stays in-process only.
        self.maintenance_cancel.cancel();
        self.apply_pause(None, true).await;

        let deadline = Instant::now() + grace;
        let owned: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .roles
                .values()
                .flat_map(|fleet| fleet.loops.iter().map(|entry| entry.instance_id))
                .collect()
        };

        let drained = loop {
            let busy = match self.agents.list().await {
                Ok(agents) => agents
                    .iter()
                    .filter(|a| owned.contains(&a.instance_id))
                    .any(|a| a.state == AgentState::Busy),
                Err(err) => {
                    tracing::error!(error = %err, "drain check failed");
                    false
                }
            };
            if !busy {
                break true;
            }
            if Instant::now() >= deadline {
                tracing::warn!("shutdown deadline exceeded; force-cancelling loops");
                break false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };

        self.cancel.cancel();

        let mut state = self.state.lock().await;
        let _ = futures::future::join_all(state.maintenance.drain(..)).await;
        for (_, fleet) in state.roles.iter_mut() {
            for entry in fleet.loops.drain(..) {
                if tokio::time::timeout(Duration::from_secs(5), entry.handle)
                    .await
                    .is_err()
                {
                    tracing::warn!(instance_id = %entry.instance_id, "loop join timed out");
                }
                // Whatever the loop left behind goes back to the queue.
                if let Err(err) = self
                    .board
                    .recover_instance(entry.instance_id, Utc::now(), "instance stopping")
                    .await
                {
                    tracing::error!(error = %err, "release on stop failed");
                }
                let _ = self.agents.mark_stopped(entry.instance_id).await;
            }
        }
        drained
    }
}
