//! Event bus between the mining engine and the external control surface.
//!
//! Outbound events are a closed set of tagged variants; any transport that
//! can push JSON (websocket, SSE, IPC) can subscribe and forward them.
//! Inbound control operations carry a oneshot reply so the surface can
//! report failures like `ChannelNotFound` back to the user.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::Result;
use crate::models::{Campaign, Channel, TimedDrop};

/// Buffered events per subscriber before a slow consumer starts lagging.
const EVENT_BUFFER: usize = 256;

// =============================================================================
// Outbound payloads
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub game: Option<String>,
    pub game_id: Option<String>,
    pub game_icon: Option<String>,
    pub viewers: u64,
    pub online: bool,
    pub drops_enabled: bool,
    pub acl_based: bool,
    pub watching: bool,
}

impl From<&Channel> for ChannelSummary {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id.clone(),
            name: channel.name().to_string(),
            game: channel.game.as_ref().map(|g| g.display_name.clone()),
            game_id: channel.game.as_ref().map(|g| g.id.clone()),
            game_icon: channel.game.as_ref().and_then(|g| g.box_art_url.clone()),
            viewers: channel.viewers(),
            online: channel.online(),
            drops_enabled: channel.drops_enabled,
            acl_based: channel.acl_based,
            watching: channel.watching,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DropSummary {
    pub id: String,
    pub name: String,
    pub required_minutes: u32,
    pub current_minutes: u32,
    pub is_claimed: bool,
    pub can_claim: bool,
    pub benefits: Vec<String>,
}

impl From<&TimedDrop> for DropSummary {
    fn from(drop: &TimedDrop) -> Self {
        Self {
            id: drop.id.clone(),
            name: drop.name.clone(),
            required_minutes: drop.required_minutes,
            current_minutes: drop.current_minutes,
            is_claimed: drop.is_claimed,
            can_claim: drop.can_claim(),
            benefits: drop.benefits.iter().map(|b| b.name.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub id: String,
    pub name: String,
    pub game: String,
    pub game_id: String,
    pub link_url: String,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub linked: bool,
    pub acl_based: bool,
    pub claimed_drops: usize,
    pub total_drops: usize,
    pub drops: Vec<DropSummary>,
}

impl From<&Campaign> for CampaignSummary {
    fn from(campaign: &Campaign) -> Self {
        Self {
            id: campaign.id.clone(),
            name: campaign.name.clone(),
            game: campaign.game.display_name.clone(),
            game_id: campaign.game.id.clone(),
            link_url: campaign.link_url.clone(),
            status: format!("{:?}", campaign.status(Utc::now())).to_uppercase(),
            starts_at: campaign.starts_at,
            ends_at: campaign.ends_at,
            linked: campaign.linked,
            acl_based: campaign.acl_based(),
            claimed_drops: campaign.claimed_drops_count(),
            total_drops: campaign.total_drops_count(),
            drops: campaign.drops.iter().map(DropSummary::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub drop_id: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub game_name: String,
    pub drop_name: String,
    pub current_minutes: u32,
    pub required_minutes: u32,
    pub progress: f64,
    pub remaining_seconds: u64,
}

// =============================================================================
// Outbound events
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StatusUpdate { status: String },
    ConsoleOutput { line: String },

    ChannelAdd { channel: ChannelSummary },
    ChannelUpdate { channel: ChannelSummary },
    ChannelRemove { id: String },
    ChannelsBatchUpdate { list: Vec<ChannelSummary> },
    ChannelsClear,
    ChannelWatching { id: String },
    ChannelWatchingClear,

    CampaignAdd { campaign: CampaignSummary },
    InventoryBatchUpdate { list: Vec<CampaignSummary> },
    InventoryClear,
    DropUpdate { campaign_id: String, drop: DropSummary },

    DropProgress { report: ProgressReport },
    DropProgressStop,

    LoginRequired,
    OauthCodeRequired { url: String, code: String },
    LoginStatus { line: String },

    SettingsUpdated,
    GamesAvailable { list: Vec<String> },
    ManualModeUpdate { active: bool, game_name: Option<String> },
    WantedItemsUpdate { tree: serde_json::Value },
    ThemeChange { dark: bool },

    /// User input is needed (login, captcha, terminal platform error).
    AttentionRequired { sound: bool },
}

// =============================================================================
// Inbound control operations
// =============================================================================

#[derive(Debug)]
pub enum ControlAction {
    SelectChannel { id: String },
    ExitManualMode,
    Reload,
    SetSettings { patch: serde_json::Value },
    VerifyProxy { url: String },
    Shutdown,
}

/// A control request with its reply slot.
#[derive(Debug)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub reply: oneshot::Sender<Result<()>>,
}

impl ControlRequest {
    pub fn new(action: ControlAction) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self { action, reply: tx }, rx)
    }

    pub fn respond(self, result: Result<()>) {
        let _ = self.reply.send(result);
    }
}

// =============================================================================
// Bus handles
// =============================================================================

/// Broadcast sender for outbound events. Cheap to clone; emitting with no
/// subscribers is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// One-line status summary; kept current at all times.
    pub fn status(&self, status: impl Into<String>) {
        self.emit(Event::StatusUpdate {
            status: status.into(),
        });
    }

    /// Console stream: warnings, retries, recovered errors.
    pub fn console(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!("{line}");
        self.emit(Event::ConsoleOutput { line });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the inbound control channel.
pub fn control_channel() -> (mpsc::Sender<ControlRequest>, mpsc::Receiver<ControlRequest>) {
    mpsc::channel(32)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tags() {
        let event = Event::OauthCodeRequired {
            url: "https://www.twitch.tv/activate".to_string(),
            code: "ABCD1234".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "oauth_code_required");
        assert_eq!(json["code"], "ABCD1234");

        let json = serde_json::to_value(Event::DropProgressStop).unwrap();
        assert_eq!(json["type"], "drop_progress_stop");

        let json = serde_json::to_value(Event::InventoryClear).unwrap();
        assert_eq!(json["type"], "inventory_clear");
    }

    #[test]
    fn test_progress_report_shape() {
        let event = Event::DropProgress {
            report: ProgressReport {
                drop_id: "d1".into(),
                campaign_id: "c1".into(),
                campaign_name: "Campaign".into(),
                game_name: "Game".into(),
                drop_name: "Drop".into(),
                current_minutes: 30,
                required_minutes: 60,
                progress: 0.5,
                remaining_seconds: 1800,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "drop_progress");
        assert_eq!(json["report"]["remaining_seconds"], 1800);
    }

    #[tokio::test]
    async fn test_bus_fanout() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        bus.status("watching");
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            Event::StatusUpdate { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            Event::StatusUpdate { .. }
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(Event::ChannelsClear);
    }

    #[tokio::test]
    async fn test_control_request_reply() {
        let (request, rx) = ControlRequest::new(ControlAction::Reload);
        request.respond(Ok(()));
        assert!(rx.await.unwrap().is_ok());
    }
}
