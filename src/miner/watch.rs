//! Watch policy: progress reconciliation and the active watch context.
//!
//! The heartbeat task only moves bytes; everything stateful happens here, on
//! the state-machine task. Authoritative progress arrives over pubsub; when
//! the realtime feed goes quiet the watcher extrapolates one minute per wall
//! minute and snaps back to the server value on the next report.

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::Instant;

use crate::constants::{gql_operations, PROGRESS_SILENCE_GRACE};
use crate::error::Result;
use crate::events::{ChannelSummary, DropSummary, Event, ProgressReport};
use crate::heartbeat::{heartbeat_loop, Heartbeat, PulseOutcome, WatchTarget};
use crate::miner::inventory::InventoryOps;
use crate::miner::Miner;
use crate::models::{Stream, WireStreamInfo};
use crate::websocket::PubSubEvent;

/// Consecutive heartbeat failures tolerated before abandoning the channel.
const MAX_PULSE_FAILURES: u32 = 5;

/// Render a minute count as `H:MM` for the status line.
fn format_minutes(total: u32) -> String {
    format!("{}:{:02}", total / 60, total % 60)
}

/// Last authoritative progress tuple, used to order reports.
#[derive(Debug, Clone)]
pub struct ProgressStamp {
    pub drop_id: String,
    pub minutes: u32,
    pub at: DateTime<Utc>,
}

/// State of the currently watched channel.
#[derive(Debug)]
pub struct WatchContext {
    pub channel_id: String,
    pub channel_login: String,
    /// The drop expected to gain progress from our heartbeats.
    pub active_drop: Option<String>,
    pub last_report: Option<ProgressStamp>,
    /// When the server last confirmed progress; extrapolation baseline.
    pub last_authoritative: Instant,
    pulse_failures: u32,
}

impl WatchContext {
    fn new(channel_id: String, channel_login: String) -> Self {
        Self {
            channel_id,
            channel_login,
            active_drop: None,
            last_report: None,
            last_authoritative: Instant::now(),
            pulse_failures: 0,
        }
    }

    /// Whether `(drop_id, at)` is newer than the last reconciled tuple.
    fn is_newer(&self, drop_id: &str, at: DateTime<Utc>) -> bool {
        match &self.last_report {
            Some(stamp) => at > stamp.at || stamp.drop_id != drop_id,
            None => true,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait WatchOps {
    /// Start watching `channel_id`: flag it, spawn the heartbeat loop,
    /// resolve the drop expected to progress.
    async fn switch_to(&mut self, channel_id: &str) -> Result<()>;
    /// Tear down the active watch. `announce` emits the stop events.
    fn stop_watching(&mut self, announce: bool);
    /// Dispatch one decoded pubsub event.
    async fn handle_pubsub_event(&mut self, event: PubSubEvent) -> Result<()>;
    /// Dispatch one heartbeat outcome.
    async fn handle_pulse(&mut self, outcome: PulseOutcome) -> Result<()>;
    /// Once-a-minute extrapolation when the realtime feed is silent.
    async fn extrapolate_tick(&mut self) -> Result<()>;
}

impl Miner {
    /// Emit a `drop_progress` tick for one drop and keep the one-line
    /// status summary current.
    pub(crate) fn emit_progress(&self, drop_id: &str) {
        let Some((campaign, drop)) = self.campaigns.find_drop(drop_id) else {
            return;
        };
        self.bus.emit(Event::DropProgress {
            report: ProgressReport {
                drop_id: drop.id.clone(),
                campaign_id: campaign.id.clone(),
                campaign_name: campaign.name.clone(),
                game_name: campaign.game.display_name.clone(),
                drop_name: drop.name.clone(),
                current_minutes: drop.current_minutes,
                required_minutes: drop.required_minutes,
                progress: drop.progress(),
                remaining_seconds: u64::from(drop.remaining_minutes()) * 60,
            },
        });
        let login = self
            .watch
            .as_ref()
            .map(|w| w.channel_login.as_str())
            .unwrap_or("?");
        self.bus.status(format!(
            "Watching {login}: {} {} / {}",
            drop.name,
            format_minutes(drop.current_minutes),
            format_minutes(drop.required_minutes),
        ));
    }

    /// Pick the drop our heartbeats should be feeding, from local state:
    /// the first wanted drop of the earliest-ending active campaign for the
    /// watched channel's game.
    fn resolve_active_drop_locally(&mut self) -> Option<String> {
        let game_id = self
            .channels
            .watching()
            .and_then(|c| c.game.as_ref())
            .map(|g| g.id.clone())?;
        let gate = self.benefit_gate();
        let now = Utc::now();
        let drop_id = self
            .campaigns
            .ordered()
            .iter()
            .filter(|c| c.game.id == game_id && c.is_active(now))
            .find_map(|c| c.first_wanted_drop(gate).map(|d| d.id.clone()));
        if let Some(watch) = self.watch.as_mut() {
            watch.active_drop = drop_id.clone();
        }
        drop_id
    }

    /// Ask the platform which drop the current session is progressing and
    /// adopt it. Falls back to the local resolution.
    async fn resolve_active_drop_via_server(&mut self) -> Option<String> {
        let channel_id = self.watch.as_ref()?.channel_id.clone();
        let response = self
            .http
            .gql(
                &gql_operations::CURRENT_DROP,
                Some(json!({"channelID": channel_id, "channelLogin": ""})),
            )
            .await;
        let resolved = match response {
            Ok(data) => data["currentUser"]["dropCurrentSession"]["dropID"]
                .as_str()
                .map(String::from)
                .filter(|id| self.campaigns.find_drop(id).is_some()),
            Err(e) => {
                tracing::warn!("current-drop lookup failed: {e}");
                None
            }
        };
        match resolved {
            Some(id) => {
                if let Some(watch) = self.watch.as_mut() {
                    watch.active_drop = Some(id.clone());
                }
                Some(id)
            }
            None => self.resolve_active_drop_locally(),
        }
    }

    /// A drop completed: claim it, stop the progress stream, and re-evaluate
    /// selection after the debounce.
    async fn finish_drop(&mut self, drop_id: &str) -> Result<()> {
        match self.claim_drop(drop_id).await {
            Ok(true) => {
                self.bus.emit(Event::DropProgressStop);
                if let Some(watch) = self.watch.as_mut() {
                    if watch.active_drop.as_deref() == Some(drop_id) {
                        watch.active_drop = None;
                    }
                }
                self.schedule_post_claim_switch().await;
            }
            Ok(false) => {}
            Err(e) => self.bus.console(format!("Claim failed, will retry: {e}")),
        }
        Ok(())
    }

    fn emit_channel_update(&self, channel_id: &str) {
        if let Some(channel) = self.channels.get(channel_id) {
            self.bus.emit(Event::ChannelUpdate {
                channel: ChannelSummary::from(channel),
            });
        }
    }
}

impl WatchOps for Miner {
    async fn switch_to(&mut self, channel_id: &str) -> Result<()> {
        self.stop_watching(false);
        self.channels.set_watching(channel_id)?;

        let (login, broadcast_id, game_name) = {
            let channel = self
                .channels
                .get(channel_id)
                .expect("set_watching verified existence");
            (
                channel.login.clone(),
                channel
                    .stream
                    .as_ref()
                    .expect("set_watching verified liveness")
                    .broadcast_id
                    .clone(),
                channel
                    .game
                    .as_ref()
                    .map(|g| g.display_name.clone())
                    .unwrap_or_default(),
            )
        };

        let user_id = self
            .auth
            .read()
            .expect("auth lock poisoned")
            .user_id
            .unwrap_or_default();
        let heartbeat = Heartbeat::new(self.http.clone(), user_id);
        let beacon_url = match heartbeat.fetch_beacon_url(&login).await {
            Ok(url) => url,
            Err(e) => {
                self.channels.clear_watching();
                return Err(e);
            }
        };
        // Keep the refreshed beacon on the stream for observability.
        let viewers = self
            .channels
            .get(channel_id)
            .map(|c| c.viewers())
            .unwrap_or(0);
        self.channels.set_online(
            channel_id,
            Stream {
                broadcast_id: broadcast_id.clone(),
                viewers,
                beacon_url: Some(beacon_url.clone()),
            },
        );

        let target = WatchTarget {
            channel_id: channel_id.to_string(),
            channel_login: login.clone(),
            broadcast_id,
            beacon_url,
        };
        let task = tokio::spawn(heartbeat_loop(
            heartbeat,
            target,
            self.settings.heartbeat_interval(),
            self.pulse_tx.clone(),
        ));
        self.watch_task = Some(task);
        self.watch = Some(WatchContext::new(channel_id.to_string(), login.clone()));

        self.bus.emit(Event::ChannelWatching {
            id: channel_id.to_string(),
        });
        self.emit_channel_update(channel_id);
        self.bus
            .status(format!("Watching {login} ({game_name})"));

        if let Some(drop_id) = self.resolve_active_drop_locally() {
            self.emit_progress(&drop_id);
        } else {
            self.bus.emit(Event::DropProgressStop);
        }
        Ok(())
    }

    fn stop_watching(&mut self, announce: bool) {
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
        let had_watch = self.watch.take().is_some();
        let previous = self.channels.watching_id().map(String::from);
        self.channels.clear_watching();
        if let Some(id) = previous {
            self.emit_channel_update(&id);
        }
        if announce && had_watch {
            self.bus.emit(Event::DropProgressStop);
            self.bus.emit(Event::ChannelWatchingClear);
        }
    }

    async fn handle_pubsub_event(&mut self, event: PubSubEvent) -> Result<()> {
        match event {
            PubSubEvent::DropProgress {
                drop_id,
                current_minutes,
                at,
            } => {
                let fresh = self
                    .watch
                    .as_ref()
                    .map(|w| w.is_newer(&drop_id, at))
                    .unwrap_or(true);
                if !fresh {
                    return Ok(());
                }
                if self.campaigns.find_drop(&drop_id).is_none() {
                    // Progress for a campaign we have not absorbed yet.
                    tracing::debug!("progress for unknown drop {drop_id}, scheduling refresh");
                    self.trigger.inventory();
                    return Ok(());
                }
                self.campaigns
                    .report_progress(&drop_id, current_minutes, true)?;

                let mut resolved = drop_id.clone();
                let sibling_report = match self.watch.as_mut() {
                    Some(watch) => {
                        let expected = watch.active_drop.clone();
                        watch.last_report = Some(ProgressStamp {
                            drop_id: drop_id.clone(),
                            minutes: current_minutes,
                            at,
                        });
                        watch.last_authoritative = Instant::now();
                        if expected.is_none() {
                            watch.active_drop = Some(drop_id.clone());
                        }
                        expected.is_some() && expected.as_deref() != Some(drop_id.as_str())
                    }
                    None => false,
                };
                // The server attributed progress to a sibling drop;
                // re-resolve which drop this session is actually feeding.
                if sibling_report {
                    if let Some(id) = self.resolve_active_drop_via_server().await {
                        resolved = id;
                    }
                }
                self.emit_progress(&resolved);

                let complete = self
                    .campaigns
                    .find_drop(&drop_id)
                    .map(|(_, d)| d.can_claim())
                    .unwrap_or(false);
                if complete {
                    self.finish_drop(&drop_id).await?;
                }
            }
            PubSubEvent::DropClaim {
                drop_instance_id,
                drop_id,
            } => {
                tracing::info!("drop claim notification for {drop_instance_id}");
                if let Some(drop_id) = drop_id {
                    if self.campaigns.find_drop(&drop_id).is_some() {
                        if self.campaigns.mark_claimed(&drop_id)? {
                            if let Some((campaign, drop)) = self.campaigns.find_drop(&drop_id) {
                                let campaign_id = campaign.id.clone();
                                let summary = DropSummary::from(drop);
                                self.bus.emit(Event::DropUpdate {
                                    campaign_id,
                                    drop: summary,
                                });
                            }
                        }
                    }
                }
                // A claim changes what is wanted; refresh on the next pass.
                self.trigger.inventory();
            }
            PubSubEvent::StreamUp { channel_id } => {
                let login = self.channels.get(&channel_id).map(|c| c.login.clone());
                if let Some(login) = login {
                    // Attach the fresh stream before re-selection.
                    match self
                        .http
                        .gql(
                            &gql_operations::GET_STREAM_INFO,
                            Some(json!({"channel": login})),
                        )
                        .await
                    {
                        Ok(data) => match serde_json::from_value::<WireStreamInfo>(data) {
                            Ok(info) => {
                                if let Some(stream) = info.user.and_then(|u| u.stream) {
                                    let badge = stream.drops_enabled;
                                    self.channels.set_online(
                                        &channel_id,
                                        Stream {
                                            broadcast_id: stream.id,
                                            viewers: stream.viewers,
                                            beacon_url: None,
                                        },
                                    );
                                    self.channels.set_drops_badge(&channel_id, badge);
                                }
                            }
                            Err(e) => tracing::warn!("bad stream info after stream-up: {e}"),
                        },
                        Err(e) => tracing::warn!("stream info after stream-up failed: {e}"),
                    }
                    self.emit_channel_update(&channel_id);
                    self.trigger.channel_event();
                }
            }
            PubSubEvent::StreamDown { channel_id } => {
                let was_watching = self.channels.watching_id() == Some(channel_id.as_str());
                self.channels.set_offline(&channel_id);
                if was_watching {
                    self.bus.console("Watched channel went offline");
                    self.stop_watching(true);
                }
                self.emit_channel_update(&channel_id);
                self.trigger.channel_event();
            }
            PubSubEvent::ViewersUpdate {
                channel_id,
                viewers,
            } => {
                if self.channels.update_stream(&channel_id, Some(viewers), None) {
                    self.emit_channel_update(&channel_id);
                }
            }
            PubSubEvent::BroadcastUpdate { channel_id, game } => {
                if self.channels.update_stream(&channel_id, None, game) {
                    self.emit_channel_update(&channel_id);
                    self.trigger.channel_event();
                }
            }
        }
        Ok(())
    }

    async fn handle_pulse(&mut self, outcome: PulseOutcome) -> Result<()> {
        match outcome {
            PulseOutcome::Sent => {
                if let Some(watch) = self.watch.as_mut() {
                    watch.pulse_failures = 0;
                }
            }
            PulseOutcome::BeaconRefreshed { broadcast_id } => {
                if let Some(watch) = self.watch.as_ref() {
                    let viewers = self
                        .channels
                        .get(&watch.channel_id)
                        .map(|c| c.viewers())
                        .unwrap_or(0);
                    let channel_id = watch.channel_id.clone();
                    self.channels.set_online(
                        &channel_id,
                        Stream {
                            broadcast_id,
                            viewers,
                            beacon_url: None,
                        },
                    );
                }
            }
            PulseOutcome::ChannelGone => {
                if let Some(watch) = self.watch.as_ref() {
                    let channel_id = watch.channel_id.clone();
                    self.bus
                        .console("Watched stream ended (stale beacon unrecoverable)");
                    self.channels.set_offline(&channel_id);
                    self.stop_watching(true);
                    self.trigger.channel_event();
                }
            }
            PulseOutcome::Failed(reason) => {
                self.bus
                    .console(format!("Heartbeat failed (will keep trying): {reason}"));
                if let Some(watch) = self.watch.as_mut() {
                    watch.pulse_failures += 1;
                    if watch.pulse_failures >= MAX_PULSE_FAILURES {
                        self.bus
                            .console("Too many failed heartbeats, switching channels");
                        self.stop_watching(true);
                        self.trigger.channel_event();
                    }
                }
            }
        }
        Ok(())
    }

    async fn extrapolate_tick(&mut self) -> Result<()> {
        let Some(watch) = self.watch.as_ref() else {
            return Ok(());
        };
        let silence = self.settings.heartbeat_interval() + PROGRESS_SILENCE_GRACE;
        if watch.last_authoritative.elapsed() <= silence {
            return Ok(());
        }
        let Some(drop_id) = watch.active_drop.clone() else {
            return Ok(());
        };
        if !self.campaigns.bump_minute(&drop_id) {
            return Ok(());
        }
        tracing::debug!("no authoritative progress, bumped {drop_id} locally");
        self.emit_progress(&drop_id);

        let complete = self
            .campaigns
            .find_drop(&drop_id)
            .map(|(_, d)| d.can_claim())
            .unwrap_or(false);
        if complete {
            self.finish_drop(&drop_id).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::tests::test_miner;
    use crate::models::{Campaign, WireCampaign};

    fn seed_campaign(miner: &mut Miner, drop_id: &str, current: u32, required: u32) {
        let wire: WireCampaign = serde_json::from_value(json!({
            "id": "c1",
            "name": "Campaign",
            "game": {"id": "g1", "name": "GameOne"},
            "startAt": "2024-01-01T00:00:00Z",
            "endAt": "2099-12-31T23:59:59Z",
            "timeBasedDrops": [{
                "id": drop_id,
                "name": "Drop",
                "requiredMinutesWatched": required,
                "self": {
                    "currentMinutesWatched": current,
                    "isClaimed": false,
                    "dropInstanceID": format!("{drop_id}-inst")
                }
            }]
        }))
        .unwrap();
        miner.campaigns.upsert(Campaign::from_wire(wire).unwrap());
    }

    fn seed_watch(miner: &mut Miner, drop_id: &str) {
        let mut context = WatchContext::new("ch1".into(), "login_ch1".into());
        context.active_drop = Some(drop_id.to_string());
        miner.watch = Some(context);
    }

    #[tokio::test]
    async fn test_authoritative_report_wins_over_bumps() {
        let mut miner = test_miner();
        seed_campaign(&mut miner, "d1", 10, 60);
        seed_watch(&mut miner, "d1");

        // Local extrapolation ran ahead.
        for _ in 0..5 {
            miner.campaigns.bump_minute("d1");
        }
        assert_eq!(miner.campaigns.find_drop("d1").unwrap().1.current_minutes, 15);

        // Server says 12; the snap may regress local state.
        miner
            .handle_pubsub_event(PubSubEvent::DropProgress {
                drop_id: "d1".into(),
                current_minutes: 12,
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(miner.campaigns.find_drop("d1").unwrap().1.current_minutes, 12);
    }

    #[tokio::test]
    async fn test_stale_report_is_ignored() {
        let mut miner = test_miner();
        seed_campaign(&mut miner, "d1", 10, 60);
        seed_watch(&mut miner, "d1");

        let now = Utc::now();
        miner
            .handle_pubsub_event(PubSubEvent::DropProgress {
                drop_id: "d1".into(),
                current_minutes: 20,
                at: now,
            })
            .await
            .unwrap();
        // An older tuple for the same drop must not regress anything.
        miner
            .handle_pubsub_event(PubSubEvent::DropProgress {
                drop_id: "d1".into(),
                current_minutes: 5,
                at: now - chrono::Duration::seconds(30),
            })
            .await
            .unwrap();
        assert_eq!(miner.campaigns.find_drop("d1").unwrap().1.current_minutes, 20);
        let stamp = miner.watch.as_ref().unwrap().last_report.as_ref().unwrap();
        assert_eq!(stamp.minutes, 20);
        assert_eq!(stamp.drop_id, "d1");
    }

    #[tokio::test]
    async fn test_unknown_drop_schedules_refresh() {
        let mut miner = test_miner();
        miner
            .handle_pubsub_event(PubSubEvent::DropProgress {
                drop_id: "mystery".into(),
                current_minutes: 3,
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(miner.trigger.is_pending());
        assert!(miner.trigger.forces_inventory());
    }

    #[tokio::test]
    async fn test_extrapolation_waits_for_silence() {
        let mut miner = test_miner();
        seed_campaign(&mut miner, "d1", 10, 60);
        seed_watch(&mut miner, "d1");

        // Fresh authoritative baseline: no bump yet.
        miner.extrapolate_tick().await.unwrap();
        assert_eq!(miner.campaigns.find_drop("d1").unwrap().1.current_minutes, 10);

        // Age the baseline past interval + grace.
        tokio::time::pause();
        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        miner.extrapolate_tick().await.unwrap();
        assert_eq!(miner.campaigns.find_drop("d1").unwrap().1.current_minutes, 11);
    }

    #[tokio::test]
    async fn test_stream_down_stops_watching_and_retriggers() {
        let mut miner = test_miner();
        let channel = crate::models::Channel {
            id: "ch1".into(),
            login: "login_ch1".into(),
            display_name: None,
            game: None,
            drops_enabled: true,
            acl_based: false,
            stream: Some(Stream {
                broadcast_id: "b1".into(),
                viewers: 10,
                beacon_url: None,
            }),
            watching: false,
        };
        miner.channels.upsert(channel);
        miner.channels.set_watching("ch1").unwrap();
        seed_watch(&mut miner, "d1");

        miner
            .handle_pubsub_event(PubSubEvent::StreamDown {
                channel_id: "ch1".into(),
            })
            .await
            .unwrap();

        assert!(miner.watch.is_none());
        assert!(miner.channels.watching_id().is_none());
        assert!(miner.trigger.is_pending());
        assert!(!miner.trigger.forces_inventory());
    }

    #[tokio::test]
    async fn test_repeated_pulse_failures_abandon_channel() {
        let mut miner = test_miner();
        seed_watch(&mut miner, "d1");
        for _ in 0..MAX_PULSE_FAILURES {
            miner
                .handle_pulse(PulseOutcome::Failed("timeout".into()))
                .await
                .unwrap();
        }
        assert!(miner.watch.is_none());
        assert!(miner.trigger.is_pending());
    }

    #[test]
    fn test_format_minutes_for_status_line() {
        assert_eq!(format_minutes(0), "0:00");
        assert_eq!(format_minutes(59), "0:59");
        assert_eq!(format_minutes(150), "2:30");
    }

    #[tokio::test]
    async fn test_pulse_success_resets_failure_count() {
        let mut miner = test_miner();
        seed_watch(&mut miner, "d1");
        for _ in 0..MAX_PULSE_FAILURES - 1 {
            miner
                .handle_pulse(PulseOutcome::Failed("timeout".into()))
                .await
                .unwrap();
        }
        miner.handle_pulse(PulseOutcome::Sent).await.unwrap();
        miner
            .handle_pulse(PulseOutcome::Failed("timeout".into()))
            .await
            .unwrap();
        // One failure after a success is far from the threshold.
        assert!(miner.watch.is_some());
    }
}
