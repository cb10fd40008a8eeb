//! Channel and stream domain model.
//!
//! Channels live in a registry keyed by id; the registry owns the
//! "at most one channel is being watched" invariant and the hard cap on the
//! working set.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Deserialize;

use crate::constants::MAX_CHANNELS;
use crate::error::{AgentError, Result};
use crate::models::campaign::Game;

// =============================================================================
// Wire shapes
// =============================================================================

/// `VideoPlayerStreamInfoOverlayChannel` response.
#[derive(Debug, Clone, Deserialize)]
pub struct WireStreamInfo {
    pub user: Option<WireStreamUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStreamUser {
    pub id: String,
    pub login: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub stream: Option<WireStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStream {
    pub id: String,
    #[serde(rename = "viewersCount", default)]
    pub viewers: u64,
    /// Drops badge on the live broadcast.
    #[serde(rename = "dropsEnabled", default)]
    pub drops_enabled: bool,
    #[serde(default)]
    pub game: Option<Game>,
}

/// `DirectoryPage_Game` response.
#[derive(Debug, Clone, Deserialize)]
pub struct WireDirectory {
    pub game: Option<WireDirectoryGame>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDirectoryGame {
    pub id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub streams: Option<WireStreamConnection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStreamConnection {
    #[serde(default)]
    pub edges: Vec<WireStreamEdge>,
    #[serde(rename = "pageInfo", default)]
    pub page_info: Option<WirePageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePageInfo {
    #[serde(rename = "hasNextPage", default)]
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStreamEdge {
    #[serde(default)]
    pub cursor: Option<String>,
    pub node: WireDirectoryStream,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDirectoryStream {
    /// Broadcast id of the live stream.
    pub id: String,
    #[serde(rename = "viewersCount", default)]
    pub viewers: u64,
    #[serde(rename = "dropsEnabled", default)]
    pub drops_enabled: bool,
    #[serde(default)]
    pub broadcaster: Option<WireBroadcaster>,
    #[serde(default)]
    pub game: Option<Game>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBroadcaster {
    pub id: String,
    pub login: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

// =============================================================================
// Domain types
// =============================================================================

/// A live broadcast attached to a channel.
#[derive(Debug, Clone)]
pub struct Stream {
    pub broadcast_id: String,
    pub viewers: u64,
    /// Opaque heartbeat endpoint; refreshed on each stream-info fetch.
    pub beacon_url: Option<String>,
}

/// A tracked channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub login: String,
    pub display_name: Option<String>,
    pub game: Option<Game>,
    pub drops_enabled: bool,
    /// Sourced from a campaign allow-list rather than a directory query.
    pub acl_based: bool,
    pub stream: Option<Stream>,
    pub watching: bool,
}

impl Channel {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }

    pub fn url(&self) -> String {
        format!("https://www.twitch.tv/{}", self.login)
    }

    pub fn online(&self) -> bool {
        self.stream.is_some()
    }

    pub fn viewers(&self) -> u64 {
        self.stream.as_ref().map(|s| s.viewers).unwrap_or(0)
    }

    /// Build from a stream-info probe. Allow-listed channels can grant
    /// drops by construction; everything else relies on the stream badge.
    pub fn from_stream_info(user: WireStreamUser, acl_based: bool) -> Self {
        let game = user.stream.as_ref().and_then(|s| s.game.clone());
        let drops_enabled =
            acl_based || user.stream.as_ref().map(|s| s.drops_enabled).unwrap_or(false);
        Self {
            id: user.id,
            login: user.login,
            display_name: user.display_name,
            game,
            drops_enabled,
            acl_based,
            stream: user.stream.map(|s| Stream {
                broadcast_id: s.id,
                viewers: s.viewers,
                beacon_url: None,
            }),
            watching: false,
        }
    }

    /// Build from one directory listing edge.
    pub fn from_directory(node: WireDirectoryStream, game: Game) -> Option<Self> {
        let broadcaster = node.broadcaster?;
        Some(Self {
            id: broadcaster.id,
            login: broadcaster.login,
            display_name: broadcaster.display_name,
            game: Some(node.game.unwrap_or(game)),
            drops_enabled: node.drops_enabled,
            acl_based: false,
            stream: Some(Stream {
                broadcast_id: node.id,
                viewers: node.viewers,
                beacon_url: None,
            }),
            watching: false,
        })
    }
}

/// Selection order for automatic channel switching: game priority index,
/// then ACL-sourced before directory-sourced, then viewer count, then id.
pub fn selection_cmp(a: &Channel, b: &Channel, game_order: &[String]) -> Ordering {
    let index_of = |channel: &Channel| {
        channel
            .game
            .as_ref()
            .and_then(|g| game_order.iter().position(|id| *id == g.id))
            .unwrap_or(usize::MAX)
    };
    index_of(a)
        .cmp(&index_of(b))
        .then_with(|| b.acl_based.cmp(&a.acl_based))
        .then_with(|| b.viewers().cmp(&a.viewers()))
        .then_with(|| a.id.cmp(&b.id))
}

// =============================================================================
// Channel registry
// =============================================================================

/// Owning collection for the channel working set.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    watching: Option<String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.channels.len() >= MAX_CHANNELS
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Deterministic listing for batch events.
    pub fn ordered(&self) -> Vec<&Channel> {
        let mut all: Vec<&Channel> = self.channels.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Insert or refresh a channel. Returns false when the working set is
    /// already at capacity and the channel is new; the caller queues it.
    pub fn upsert(&mut self, mut channel: Channel) -> bool {
        match self.channels.get(&channel.id) {
            Some(existing) => {
                channel.watching = existing.watching;
                // An ACL sourcing is sticky; a directory rediscovery of the
                // same channel must not demote it.
                channel.acl_based = channel.acl_based || existing.acl_based;
                self.channels.insert(channel.id.clone(), channel);
                true
            }
            None if self.is_full() => false,
            None => {
                self.channels.insert(channel.id.clone(), channel);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Channel> {
        if self.watching.as_deref() == Some(id) {
            self.watching = None;
        }
        self.channels.remove(id)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.watching = None;
    }

    pub fn watching_id(&self) -> Option<&str> {
        self.watching.as_deref()
    }

    pub fn watching(&self) -> Option<&Channel> {
        self.channels.get(self.watching.as_deref()?)
    }

    /// Point the single watching flag at `id`. Fails if the channel is
    /// unknown or offline.
    pub fn set_watching(&mut self, id: &str) -> Result<()> {
        let online = self
            .channels
            .get(id)
            .ok_or_else(|| AgentError::ChannelNotFound(id.to_string()))?
            .online();
        if !online {
            return Err(AgentError::ChannelOffline(id.to_string()));
        }
        if let Some(previous) = self.watching.take() {
            if let Some(channel) = self.channels.get_mut(&previous) {
                channel.watching = false;
            }
        }
        if let Some(channel) = self.channels.get_mut(id) {
            channel.watching = true;
        }
        self.watching = Some(id.to_string());
        Ok(())
    }

    pub fn clear_watching(&mut self) {
        if let Some(previous) = self.watching.take() {
            if let Some(channel) = self.channels.get_mut(&previous) {
                channel.watching = false;
            }
        }
    }

    /// Attach a live stream to a channel (stream-up or info refresh).
    pub fn set_online(&mut self, id: &str, stream: Stream) -> bool {
        match self.channels.get_mut(id) {
            Some(channel) => {
                channel.stream = Some(stream);
                true
            }
            None => false,
        }
    }

    /// Detach the stream; a channel without a stream has no viewer count.
    /// Clears the watching flag if it pointed here.
    pub fn set_offline(&mut self, id: &str) -> bool {
        let Some(channel) = self.channels.get_mut(id) else {
            return false;
        };
        channel.stream = None;
        if channel.watching {
            channel.watching = false;
            self.watching = None;
        }
        true
    }

    /// Refresh the drops badge from a stream-info fetch. ACL-sourced
    /// channels stay eligible regardless of the badge.
    pub fn set_drops_badge(&mut self, id: &str, enabled: bool) -> bool {
        let Some(channel) = self.channels.get_mut(id) else {
            return false;
        };
        channel.drops_enabled = enabled || channel.acl_based;
        true
    }

    /// Viewer-count / game refresh from a broadcast settings update.
    pub fn update_stream(&mut self, id: &str, viewers: Option<u64>, game: Option<Game>) -> bool {
        let Some(channel) = self.channels.get_mut(id) else {
            return false;
        };
        if let (Some(stream), Some(viewers)) = (channel.stream.as_mut(), viewers) {
            stream.viewers = viewers;
        }
        if game.is_some() {
            channel.game = game;
        }
        true
    }

    /// Best automatic pick among online, drops-enabled channels.
    pub fn best_candidate(&self, game_order: &[String]) -> Option<&Channel> {
        self.channels
            .values()
            .filter(|c| c.online() && c.drops_enabled)
            .filter(|c| {
                c.game
                    .as_ref()
                    .is_some_and(|g| game_order.iter().any(|id| *id == g.id))
            })
            .min_by(|a, b| selection_cmp(a, b, game_order))
    }
}

// =============================================================================
// Tests
// =============================================================================
