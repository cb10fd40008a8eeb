//! Watch heartbeats.
//!
//! Simulates a viewer by POSTing "minute-watched" beacon events for the
//! active stream. No media is ever downloaded; the beacon URL is scraped
//! from the channel page and refreshed whenever the platform reports it
//! stale (404/410).

use std::sync::LazyLock;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use regex_lite::Regex;
use reqwest::header::{HeaderMap, USER_AGENT};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::constants::{gql_operations, CLIENT_WEB};
use crate::error::{AgentError, Result};
use crate::http::SharedHttp;

// Lazy-compiled regex patterns - compiled once at first use, reused forever
static BEACON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""beacon_?url": ?"(https://video-edge-[\.\w\-/]+\.ts(?:\?allow_stream=true)?)""#)
        .expect("Invalid beacon pattern regex")
});

static SETTINGS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"src="(https://[\w\.]+/config/settings\.[0-9a-f]{32}\.js)""#)
        .expect("Invalid settings pattern regex")
});

/// Everything needed to emit heartbeats for one stream.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub channel_id: String,
    pub channel_login: String,
    pub broadcast_id: String,
    pub beacon_url: String,
}

/// Feedback from the heartbeat task to the state machine.
#[derive(Debug)]
pub enum PulseOutcome {
    /// A heartbeat went out and was accepted.
    Sent,
    /// The beacon went stale and was refreshed from a new stream-info fetch.
    BeaconRefreshed { broadcast_id: String },
    /// The channel is no longer live; the watcher should move on.
    ChannelGone,
    /// Transient failure; the loop keeps going.
    Failed(String),
}

/// The "minute-watched" payload shape the player emits.
#[derive(Debug, Clone, Serialize)]
struct BeaconEvent {
    event: &'static str,
    properties: BeaconProperties,
}

#[derive(Debug, Clone, Serialize)]
struct BeaconProperties {
    broadcast_id: String,
    channel_id: String,
    channel: String,
    hidden: bool,
    live: bool,
    location: &'static str,
    logged_in: bool,
    muted: bool,
    player: &'static str,
    user_id: u64,
}

/// Heartbeat sender bound to the shared HTTP client.
#[derive(Clone)]
pub struct Heartbeat {
    http: SharedHttp,
    user_id: u64,
}

impl Heartbeat {
    pub fn new(http: SharedHttp, user_id: u64) -> Self {
        Self { http, user_id }
    }

    /// Base64 payload for one heartbeat.
    pub fn payload(&self, target: &WatchTarget) -> String {
        let events = vec![BeaconEvent {
            event: "minute-watched",
            properties: BeaconProperties {
                broadcast_id: target.broadcast_id.clone(),
                channel_id: target.channel_id.clone(),
                channel: target.channel_login.clone(),
                hidden: false,
                live: true,
                location: "channel",
                logged_in: true,
                muted: false,
                player: "site",
                user_id: self.user_id,
            },
        }];
        let json = serde_json::to_string(&events).expect("payload serializes");
        BASE64.encode(json.as_bytes())
    }

    /// Send one heartbeat. 404/410 means the beacon is stale.
    pub async fn send(&self, target: &WatchTarget) -> Result<bool> {
        let body = format!("data={}", self.payload(target));
        match self
            .http
            .post_raw(
                &target.beacon_url,
                body,
                "application/x-www-form-urlencoded",
                HeaderMap::new(),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(AgentError::RequestInvalid { status, .. }) if status == 404 || status == 410 => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Scrape the beacon URL from the channel page, following the settings
    /// script when the page itself does not embed it.
    pub async fn fetch_beacon_url(&self, channel_login: &str) -> Result<String> {
        let url = format!("https://www.twitch.tv/{channel_login}");
        let mut headers = HeaderMap::new();
        if let Ok(value) = CLIENT_WEB.user_agent.parse() {
            headers.insert(USER_AGENT, value);
        }
        let html = self
            .http
            .get(&url, headers.clone())
            .await?
            .text()
            .await
            .map_err(|e| AgentError::Request(format!("unreadable channel page: {e}")))?;

        if let Some(captures) = BEACON_PATTERN.captures(&html) {
            return Ok(captures.get(1).expect("group 1 exists").as_str().to_string());
        }

        if let Some(captures) = SETTINGS_PATTERN.captures(&html) {
            let settings_url = captures.get(1).expect("group 1 exists").as_str().to_string();
            let settings_js = self
                .http
                .get(&settings_url, headers)
                .await?
                .text()
                .await
                .map_err(|e| AgentError::Request(format!("unreadable settings script: {e}")))?;
            if let Some(captures) = BEACON_PATTERN.captures(&settings_js) {
                return Ok(captures.get(1).expect("group 1 exists").as_str().to_string());
            }
        }

        Err(AgentError::Request(format!(
            "no beacon URL on channel page for {channel_login}"
        )))
    }

    /// Re-fetch stream info for a stale target. None means the channel went
    /// offline.
    async fn refresh_target(&self, target: &WatchTarget) -> Result<Option<WatchTarget>> {
        let data = self
            .http
            .gql(
                &gql_operations::GET_STREAM_INFO,
                Some(json!({
                    "channel": target.channel_login.as_str(),
                })),
            )
            .await?;
        let info: crate::models::WireStreamInfo = serde_json::from_value(data)?;
        let Some(stream) = info.user.and_then(|u| u.stream) else {
            return Ok(None);
        };
        let beacon_url = self.fetch_beacon_url(&target.channel_login).await?;
        Ok(Some(WatchTarget {
            channel_id: target.channel_id.clone(),
            channel_login: target.channel_login.clone(),
            broadcast_id: stream.id,
            beacon_url,
        }))
    }
}

/// The heartbeat loop for one watched channel. Runs until the task is
/// aborted (channel switch, shutdown) or the channel goes offline.
pub async fn heartbeat_loop(
    heartbeat: Heartbeat,
    mut target: WatchTarget,
    interval: Duration,
    tx: mpsc::Sender<PulseOutcome>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match heartbeat.send(&target).await {
            Ok(true) => {
                if tx.send(PulseOutcome::Sent).await.is_err() {
                    return;
                }
            }
            Ok(false) => {
                // Stale beacon: refresh stream info and retry once.
                tracing::info!("stale beacon for {}, refreshing", target.channel_login);
                match heartbeat.refresh_target(&target).await {
                    Ok(Some(fresh)) => {
                        target = fresh;
                        let outcome = match heartbeat.send(&target).await {
                            Ok(true) => PulseOutcome::BeaconRefreshed {
                                broadcast_id: target.broadcast_id.clone(),
                            },
                            Ok(false) => {
                                PulseOutcome::Failed("beacon stale after refresh".to_string())
                            }
                            Err(e) => PulseOutcome::Failed(e.to_string()),
                        };
                        if tx.send(outcome).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(PulseOutcome::ChannelGone).await;
                        return;
                    }
                    Err(e) => {
                        if tx.send(PulseOutcome::Failed(e.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                if tx.send(PulseOutcome::Failed(e.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
