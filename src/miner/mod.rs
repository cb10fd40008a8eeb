//! The mining engine.
//!
//! Owns the domain model and sequences the discovery pipeline:
//! IDLE -> INVENTORY_FETCH -> GAMES_UPDATE -> CHANNELS_CLEANUP ->
//! CHANNELS_FETCH -> CHANNEL_SWITCH -> IDLE. Background tasks (pubsub
//! shards, the heartbeat loop) never touch the model directly; they post
//! events to queues consumed here.

mod channels;
mod inventory;
mod state;
mod watch;

pub use channels::ChannelOps;
pub use inventory::InventoryOps;
pub use state::{PendingTrigger, Phase};
pub use watch::{WatchContext, WatchOps};

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::SharedAuth;
use crate::constants::POST_CLAIM_DEBOUNCE;
use crate::cookies::SharedJar;
use crate::error::{AgentError, Result};
use crate::events::{
    CampaignSummary, ChannelSummary, ControlAction, ControlRequest, Event, EventBus,
};
use crate::heartbeat::PulseOutcome;
use crate::http::SharedHttp;
use crate::models::{CampaignSet, ChannelRegistry, Game};
use crate::settings::{Environment, Settings};
use crate::websocket::{PubSubEvent, PubSubPool, Topic, TopicKind};

/// Cadence of the maintenance checks (hourly refresh, ending-soon boundary)
/// and of the extrapolation clock.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Inventory refreshes at least this often regardless of other triggers.
const HOURLY_REFRESH: Duration = Duration::from_secs(3600);

pub struct Miner {
    pub(crate) env: Environment,
    pub(crate) settings: Settings,
    pub(crate) bus: EventBus,
    pub(crate) http: SharedHttp,
    pub(crate) auth: SharedAuth,
    pub(crate) jar: SharedJar,

    pub(crate) campaigns: CampaignSet,
    pub(crate) channels: ChannelRegistry,
    /// Ordered wanted games (priority order), recomputed in GAMES_UPDATE.
    pub(crate) wanted_games: Vec<Game>,

    pub(crate) pool: PubSubPool,
    pub(crate) pubsub_rx: mpsc::Receiver<PubSubEvent>,
    pub(crate) pulse_tx: mpsc::Sender<PulseOutcome>,
    pub(crate) pulse_rx: mpsc::Receiver<PulseOutcome>,
    pub(crate) watch_task: Option<JoinHandle<()>>,
    pub(crate) watch: Option<WatchContext>,
    /// User-forced channel; suppresses automatic selection while set.
    pub(crate) manual_channel: Option<String>,

    pub(crate) phase: Phase,
    pub(crate) trigger: PendingTrigger,
    /// Whether the in-flight pipeline pass must hit the network for
    /// inventory even inside the refresh floor.
    pub(crate) pass_forces_inventory: bool,
    pub(crate) last_inventory_fetch: Option<tokio::time::Instant>,
}

impl Miner {
    pub fn new(
        env: Environment,
        settings: Settings,
        bus: EventBus,
        http: SharedHttp,
        auth: SharedAuth,
        jar: SharedJar,
    ) -> Self {
        let (pubsub_tx, pubsub_rx) = mpsc::channel(256);
        let (pulse_tx, pulse_rx) = mpsc::channel(64);
        let pool = PubSubPool::new(auth.clone(), pubsub_tx);
        Self {
            env,
            settings,
            bus,
            http,
            auth,
            jar,
            campaigns: CampaignSet::new(),
            channels: ChannelRegistry::new(),
            wanted_games: Vec::new(),
            pool,
            pubsub_rx,
            pulse_tx,
            pulse_rx,
            watch_task: None,
            watch: None,
            manual_channel: None,
            phase: Phase::Idle,
            trigger: PendingTrigger::default(),
            pass_forces_inventory: false,
            last_inventory_fetch: None,
        }
    }

    /// Drive the state machine until shutdown. Control requests arrive on
    /// `control_rx`; pushes go out on the event bus.
    pub async fn run(mut self, mut control_rx: mpsc::Receiver<ControlRequest>) -> Result<()> {
        self.subscribe_user_topics();
        self.bus.emit(Event::InventoryBatchUpdate { list: Vec::new() });
        self.bus.emit(Event::ChannelsBatchUpdate { list: Vec::new() });
        self.bus.status("Starting up");

        // Cold start runs the full pipeline.
        self.trigger.inventory();
        self.consume_trigger();

        let result = loop {
            match self.phase {
                Phase::Idle => {
                    if let Err(e) = self.idle_wait(&mut control_rx).await {
                        break Err(e);
                    }
                }
                Phase::InventoryFetch => {
                    let force = self.pass_forces_inventory;
                    match self.run_inventory_phase(force).await {
                        Ok(()) => self.phase = self.phase.next(),
                        Err(e @ (AgentError::Login(_) | AgentError::CaptchaRequired)) => {
                            self.pause_for_login();
                            break Err(e);
                        }
                        // A 401 from the platform means the token died.
                        Err(AgentError::RequestInvalid { status: 401, body }) => {
                            self.pause_for_login();
                            break Err(AgentError::Login(format!("token rejected: {body}")));
                        }
                        Err(e) => {
                            // Abort only this pass; the maintenance ticker
                            // re-schedules after the standard interval.
                            self.bus
                                .console(format!("Inventory refresh failed, will retry: {e}"));
                            self.phase = Phase::Idle;
                        }
                    }
                }
                Phase::GamesUpdate => {
                    self.run_games_update();
                    self.phase = self.phase.next();
                }
                Phase::ChannelsCleanup => {
                    self.run_channels_cleanup().await;
                    self.phase = self.phase.next();
                }
                Phase::ChannelsFetch => {
                    if let Err(e) = self.run_channels_fetch().await {
                        self.bus
                            .console(format!("Channel discovery incomplete: {e}"));
                    }
                    self.phase = self.phase.next();
                }
                Phase::ChannelSwitch => {
                    if let Err(e) = self.run_channel_switch().await {
                        self.bus.console(format!("Channel switch failed: {e}"));
                    }
                    self.phase = Phase::Idle;
                    // Triggers that arrived mid-pipeline coalesced; honor
                    // them now.
                    self.consume_trigger();
                }
                Phase::Exit => break Ok(()),
            }
        };

        self.shutdown().await;
        result
    }

    /// Subscribe the user-scoped topics (drops progress, notifications).
    fn subscribe_user_topics(&mut self) {
        let Some(user_id) = self.auth.read().expect("auth lock poisoned").user_id else {
            return;
        };
        let topics: Vec<Topic> = TopicKind::USER_KINDS
            .iter()
            .map(|kind| Topic::new(*kind, user_id.to_string()))
            .collect();
        self.pool.subscribe(topics);
    }

    /// Move to INVENTORY_FETCH if a trigger is pending.
    fn consume_trigger(&mut self) {
        if self.trigger.is_pending() {
            let taken = self.trigger.take();
            self.pass_forces_inventory = taken.forces_inventory();
            self.phase = Phase::InventoryFetch;
        }
    }

    /// Wait in IDLE for the next trigger, servicing events as they arrive.
    async fn idle_wait(&mut self, control_rx: &mut mpsc::Receiver<ControlRequest>) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so a
        // fresh idle period does not instantly re-check maintenance.
        ticker.tick().await;

        loop {
            tokio::select! {
                request = control_rx.recv() => {
                    match request {
                        Some(request) => self.handle_control(request).await,
                        None => {
                            self.phase = Phase::Exit;
                            return Ok(());
                        }
                    }
                }
                event = self.pubsub_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_pubsub_event(event).await?;
                    }
                }
                outcome = self.pulse_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_pulse(outcome).await?;
                    }
                }
                _ = ticker.tick() => {
                    self.extrapolate_tick().await?;
                    self.maintenance_check();
                }
            }

            if self.phase == Phase::Exit {
                return Ok(());
            }
            self.consume_trigger();
            if self.phase != Phase::Idle {
                return Ok(());
            }
        }
    }

    /// Hourly inventory refresh and the ending-soon boundary (one minute
    /// before a wanted campaign ends).
    fn maintenance_check(&mut self) {
        let refresh_due = self
            .last_inventory_fetch
            .map(|at| at.elapsed() >= HOURLY_REFRESH)
            .unwrap_or(true);
        if refresh_due {
            self.trigger.inventory();
            return;
        }

        let now = Utc::now();
        let gate = self.benefit_gate();
        let ending_soon = self.campaigns.ordered().iter().any(|c| {
            c.is_active(now)
                && c.has_wanted_drops(gate)
                && c.ends_within(now, chrono::Duration::minutes(1))
        });
        if ending_soon {
            self.bus
                .console("A wanted campaign is ending, refreshing inventory");
            self.trigger.inventory();
        }
    }

    /// The benefit-type gate derived from settings.
    pub(crate) fn benefit_gate(&self) -> crate::models::BenefitGate {
        self.settings.benefit_gate()
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        match request.action {
            ControlAction::SelectChannel { ref id } => {
                let result = self.enter_manual_mode(id).await;
                request.respond(result);
            }
            ControlAction::ExitManualMode => {
                self.manual_channel = None;
                self.bus.emit(Event::ManualModeUpdate {
                    active: false,
                    game_name: None,
                });
                self.trigger.channel_event();
                request.respond(Ok(()));
            }
            ControlAction::Reload => {
                self.trigger.inventory();
                request.respond(Ok(()));
            }
            ControlAction::SetSettings { ref patch } => {
                let result = self.apply_settings_patch(patch).await;
                request.respond(result);
            }
            ControlAction::VerifyProxy { ref url } => {
                let result = self.http.verify_proxy(url).await;
                request.respond(result);
            }
            ControlAction::Shutdown => {
                self.phase = Phase::Exit;
                request.respond(Ok(()));
            }
        }
    }

    /// Manual-mode override: pin the watched channel to `id`.
    async fn enter_manual_mode(&mut self, id: &str) -> Result<()> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| AgentError::ChannelNotFound(id.to_string()))?;
        if !channel.online() {
            return Err(AgentError::ChannelOffline(id.to_string()));
        }
        let game_name = channel.game.as_ref().map(|g| g.display_name.clone());
        self.manual_channel = Some(id.to_string());
        self.bus.emit(Event::ManualModeUpdate {
            active: true,
            game_name,
        });
        self.trigger.channel_event();
        Ok(())
    }

    async fn apply_settings_patch(&mut self, patch: &serde_json::Value) -> Result<()> {
        let next = self.settings.apply_patch(patch)?;
        if next.proxy != self.settings.proxy {
            let proxy = (!next.proxy.is_empty()).then(|| next.proxy.clone());
            self.http.set_proxy(proxy).await?;
        }
        let theme_changed = next.dark_mode != self.settings.dark_mode;
        let selection_changed = next.games_to_watch != self.settings.games_to_watch
            || next.mining_benefits != self.settings.mining_benefits;

        next.save(&self.env.data_dir)?;
        self.settings = next;
        self.bus.emit(Event::SettingsUpdated);
        if theme_changed {
            self.bus.emit(Event::ThemeChange {
                dark: self.settings.dark_mode,
            });
        }
        if selection_changed {
            self.trigger.channel_event();
        }
        Ok(())
    }

    /// A drop finished and was claimed; selection re-runs after a short
    /// debounce so bursts of claims coalesce.
    pub(crate) async fn schedule_post_claim_switch(&mut self) {
        tokio::time::sleep(POST_CLAIM_DEBOUNCE).await;
        self.trigger.channel_event();
    }

    fn pause_for_login(&mut self) {
        self.stop_watching(true);
        self.bus.emit(Event::LoginRequired);
        self.bus.emit(Event::AttentionRequired { sound: true });
        self.bus.status("Login required");
    }

    /// Emit the full campaign list (ordered) as one batch.
    pub(crate) fn emit_inventory_batch(&self) {
        let list: Vec<CampaignSummary> = self
            .campaigns
            .ordered()
            .into_iter()
            .map(CampaignSummary::from)
            .collect();
        self.bus.emit(Event::InventoryBatchUpdate { list });
    }

    /// Emit the full channel list (ordered) as one batch.
    pub(crate) fn emit_channels_batch(&self) {
        let list: Vec<ChannelSummary> = self
            .channels
            .ordered()
            .into_iter()
            .map(ChannelSummary::from)
            .collect();
        self.bus.emit(Event::ChannelsBatchUpdate { list });
    }

    /// Release every resource: watch task, sockets, cookie jar.
    async fn shutdown(&mut self) {
        self.stop_watching(false);
        self.pool.shutdown();
        if let Err(e) = self.jar.save().await {
            tracing::warn!("could not persist cookie jar on shutdown: {e}");
        }
        self.bus.status("Stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthState;
    use crate::cookies::CookieJar;
    use crate::http::HttpClient;

    pub(crate) fn test_miner() -> Miner {
        let path = std::env::temp_dir().join(format!(
            "agent_test_miner_{}.jar",
            uuid::Uuid::new_v4().simple()
        ));
        let jar = CookieJar::load(path);
        let auth = AuthState::shared_for_tests("tok", 12345678, "device0123456789");
        let http = HttpClient::new(jar.clone(), auth.clone(), None).unwrap();
        let env = Environment {
            data_dir: std::env::temp_dir(),
            control_port: 8080,
        };
        Miner::new(env, Settings::default(), EventBus::new(), http, auth, jar)
    }

    #[tokio::test]
    async fn test_cold_start_trigger_enters_pipeline() {
        let mut miner = test_miner();
        miner.trigger.inventory();
        miner.consume_trigger();
        assert_eq!(miner.phase, Phase::InventoryFetch);
        assert!(miner.pass_forces_inventory);
    }

    #[tokio::test]
    async fn test_channel_trigger_does_not_force_inventory() {
        let mut miner = test_miner();
        miner.trigger.channel_event();
        miner.consume_trigger();
        assert_eq!(miner.phase, Phase::InventoryFetch);
        assert!(!miner.pass_forces_inventory);
    }

    #[tokio::test]
    async fn test_manual_mode_requires_known_online_channel() {
        let mut miner = test_miner();
        let err = miner.enter_manual_mode("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::ChannelNotFound(_)));

        let mut channel = crate::models::Channel {
            id: "cc".into(),
            login: "cc_login".into(),
            display_name: None,
            game: None,
            drops_enabled: true,
            acl_based: false,
            stream: None,
            watching: false,
        };
        miner.channels.upsert(channel.clone());
        let err = miner.enter_manual_mode("cc").await.unwrap_err();
        assert!(matches!(err, AgentError::ChannelOffline(_)));

        channel.stream = Some(crate::models::Stream {
            broadcast_id: "b".into(),
            viewers: 5,
            beacon_url: None,
        });
        miner.channels.upsert(channel);
        miner.enter_manual_mode("cc").await.unwrap();
        assert_eq!(miner.manual_channel.as_deref(), Some("cc"));
        assert!(miner.trigger.is_pending());
    }

    #[tokio::test]
    async fn test_settings_patch_rejects_bad_values() {
        let mut miner = test_miner();
        let err = miner
            .apply_settings_patch(&serde_json::json!({"connection_quality": 12}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        // Original settings untouched.
        assert_eq!(miner.settings.connection_quality, 1);
    }

    #[tokio::test]
    async fn test_settings_patch_triggers_reselection() {
        let mut miner = test_miner();
        miner
            .apply_settings_patch(&serde_json::json!({"games_to_watch": ["GameA"]}))
            .await
            .unwrap();
        assert!(miner.trigger.is_pending());
        assert_eq!(miner.settings.games_to_watch, vec!["GameA"]);
    }

    #[tokio::test]
    async fn test_maintenance_fires_initial_refresh() {
        let mut miner = test_miner();
        miner.maintenance_check();
        assert!(miner.trigger.is_pending());
        assert!(miner.trigger.forces_inventory());
    }
}
