//! Channel phases: wanted games, cleanup, discovery and selection.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;

use crate::constants::gql_operations;
use crate::error::Result;
use crate::events::{ChannelSummary, Event};
use crate::miner::watch::WatchOps;
use crate::miner::Miner;
use crate::models::{Channel, Game, WireDirectory, WireStreamInfo};
use crate::websocket::{Topic, TopicKind};

/// Streams requested per directory page.
const DIRECTORY_PAGE_SIZE: u32 = 30;

/// Directory pages fetched per game and pass.
const DIRECTORY_MAX_PAGES: usize = 3;

#[allow(async_fn_in_trait)]
pub trait ChannelOps {
    /// GAMES_UPDATE: recompute the ordered wanted-games list.
    fn run_games_update(&mut self);
    /// CHANNELS_CLEANUP: drop channels whose game is no longer wanted.
    async fn run_channels_cleanup(&mut self);
    /// CHANNELS_FETCH: ACL probes plus directory queries up to the cap.
    async fn run_channels_fetch(&mut self) -> Result<()>;
    /// CHANNEL_SWITCH: pick the best channel and point the watcher at it.
    async fn run_channel_switch(&mut self) -> Result<()>;
}

impl Miner {
    /// Track a discovered channel: registry insert, pubsub topics, event.
    fn track_channel(&mut self, channel: Channel) -> bool {
        let id = channel.id.clone();
        let known = self.channels.contains(&id);
        if !self.channels.upsert(channel) {
            tracing::debug!("channel working set full, not tracking {id}");
            return false;
        }
        if !known {
            let topics: Vec<Topic> = TopicKind::CHANNEL_KINDS
                .iter()
                .map(|kind| Topic::new(*kind, id.clone()))
                .collect();
            self.pool.subscribe(topics);
            if let Some(channel) = self.channels.get(&id) {
                self.bus.emit(Event::ChannelAdd {
                    channel: ChannelSummary::from(channel),
                });
            }
        } else if let Some(channel) = self.channels.get(&id) {
            self.bus.emit(Event::ChannelUpdate {
                channel: ChannelSummary::from(channel),
            });
        }
        true
    }

    /// Ordered wanted-game ids, the priority key for selection.
    pub(crate) fn game_order(&self) -> Vec<String> {
        self.wanted_games.iter().map(|g| g.id.clone()).collect()
    }

    /// A guessed slug found nothing; ask the platform for the real one.
    async fn redirect_slug(&self, game: &Game) -> Option<String> {
        let data = self
            .http
            .gql(
                &gql_operations::SLUG_REDIRECT,
                Some(json!({"name": game.directory_slug()})),
            )
            .await
            .ok()?;
        data["game"]["slug"].as_str().map(String::from)
    }
}

impl ChannelOps for Miner {
    fn run_games_update(&mut self) {
        let now = Utc::now();
        let gate = self.benefit_gate();

        // Games carrying an active campaign with at least one wanted drop.
        let mut minable: Vec<Game> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for campaign in self.campaigns.ordered() {
            if campaign.is_active(now)
                && campaign.has_wanted_drops(gate)
                && seen.insert(campaign.game.id.clone())
            {
                minable.push(campaign.game.clone());
            }
        }

        self.wanted_games = if self.settings.games_to_watch.is_empty() {
            // No priority list: everything minable, earliest-ending first
            // (ordered() already sorts campaigns that way).
            minable.clone()
        } else {
            self.settings
                .games_to_watch
                .iter()
                .filter_map(|name| {
                    minable
                        .iter()
                        .find(|g| g.display_name.eq_ignore_ascii_case(name))
                        .cloned()
                })
                .collect()
        };

        self.bus.emit(Event::GamesAvailable {
            list: minable.iter().map(|g| g.display_name.clone()).collect(),
        });

        // Wanted tree: game -> campaigns -> wanted drops.
        let tree: Vec<serde_json::Value> = self
            .wanted_games
            .iter()
            .map(|game| {
                let campaigns: Vec<serde_json::Value> = self
                    .campaigns
                    .ordered()
                    .iter()
                    .filter(|c| c.game.id == game.id && c.is_active(now))
                    .map(|c| {
                        let drops: Vec<&str> = c
                            .drops
                            .iter()
                            .filter(|d| !d.is_claimed && d.wanted_by(gate))
                            .map(|d| d.name.as_str())
                            .collect();
                        json!({
                            "id": c.id,
                            "name": c.name,
                            "progress": c.progress(),
                            "drops": drops,
                        })
                    })
                    .collect();
                json!({"game": game.display_name, "campaigns": campaigns})
            })
            .collect();
        self.bus.emit(Event::WantedItemsUpdate { tree: json!(tree) });

        tracing::info!(
            "wanted games: {:?}",
            self.wanted_games
                .iter()
                .map(|g| g.display_name.as_str())
                .collect::<Vec<_>>()
        );
    }

    async fn run_channels_cleanup(&mut self) {
        let wanted: HashSet<&str> = self.wanted_games.iter().map(|g| g.id.as_str()).collect();
        let stale: Vec<String> = self
            .channels
            .iter()
            .filter(|c| {
                !c.online()
                    || c.game
                        .as_ref()
                        .map(|g| !wanted.contains(g.id.as_str()))
                        .unwrap_or(true)
            })
            .map(|c| c.id.clone())
            .collect();

        for id in stale {
            if self.channels.watching_id() == Some(id.as_str()) {
                self.stop_watching(true);
            }
            self.channels.remove(&id);
            self.pool.unsubscribe_channel(&id);
            self.bus.emit(Event::ChannelRemove { id });
        }
    }

    async fn run_channels_fetch(&mut self) -> Result<()> {
        self.bus.status("Discovering channels");
        let now = Utc::now();
        let wanted_ids: HashSet<String> =
            self.wanted_games.iter().map(|g| g.id.clone()).collect();

        // ACL-based campaigns first: probe each allow-listed channel and
        // keep the ones that are live.
        let acl_targets: Vec<(String, Option<String>)> = self
            .campaigns
            .ordered()
            .iter()
            .filter(|c| c.is_active(now) && c.acl_based() && wanted_ids.contains(&c.game.id))
            .flat_map(|c| c.allow_list.iter().flatten().cloned())
            .map(|entry| (entry.id, entry.login))
            .collect();

        for (channel_id, login) in acl_targets {
            if self.channels.is_full() {
                break;
            }
            let Some(login) = login else {
                tracing::debug!("allow-listed channel {channel_id} has no login, skipping probe");
                continue;
            };
            match self
                .http
                .gql(
                    &gql_operations::GET_STREAM_INFO,
                    Some(json!({"channel": login.as_str()})),
                )
                .await
            {
                Ok(data) => {
                    let info: WireStreamInfo = match serde_json::from_value(data) {
                        Ok(info) => info,
                        Err(e) => {
                            tracing::warn!("bad stream info for {login}: {e}");
                            continue;
                        }
                    };
                    let Some(user) = info.user else { continue };
                    let channel = Channel::from_stream_info(user, true);
                    if channel.online() {
                        self.track_channel(channel);
                    }
                }
                Err(e) => tracing::warn!("stream info probe for {login} failed: {e}"),
            }
        }

        // Directory queries fill the rest, in priority order.
        let games: Vec<Game> = self.wanted_games.clone();
        for game in games {
            if self.channels.is_full() {
                break;
            }
            let mut slug = game.directory_slug();
            let mut cursor: Option<String> = None;
            for _page in 0..DIRECTORY_MAX_PAGES {
                let mut variables = json!({
                    "limit": DIRECTORY_PAGE_SIZE,
                    "slug": slug.as_str(),
                    "imageWidth": 50,
                    "options": {
                        "broadcasterLanguages": [],
                        "includeRestricted": ["SUB_ONLY_LIVE"],
                        "recommendationsContext": {"platform": "web"},
                        "sort": "RELEVANCE",
                        "systemFilters": ["DROPS_ENABLED"],
                        "tags": [],
                    },
                    "sortTypeIsRecency": false
                });
                if let Some(ref cursor) = cursor {
                    variables["cursor"] = json!(cursor);
                }
                let data = match self
                    .http
                    .gql(&gql_operations::GAME_DIRECTORY, Some(variables))
                    .await
                {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!("directory query for {slug} failed: {e}");
                        break;
                    }
                };
                let directory: WireDirectory = match serde_json::from_value(data) {
                    Ok(directory) => directory,
                    Err(e) => {
                        tracing::warn!("bad directory payload for {slug}: {e}");
                        break;
                    }
                };
                if directory.game.is_none() && game.slug.is_none() && cursor.is_none() {
                    // The slug was guessed from the display name and missed;
                    // resolve the real one and retry this game once.
                    if let Some(real) = self.redirect_slug(&game).await {
                        if real != slug {
                            slug = real;
                            continue;
                        }
                    }
                    break;
                }
                let Some(streams) = directory.game.and_then(|g| g.streams) else {
                    break;
                };
                let has_next = streams
                    .page_info
                    .as_ref()
                    .map(|p| p.has_next_page)
                    .unwrap_or(false);
                let mut last_cursor = None;
                for edge in streams.edges {
                    last_cursor = edge.cursor.clone();
                    if let Some(channel) = Channel::from_directory(edge.node, game.clone()) {
                        if !self.track_channel(channel) {
                            break;
                        }
                    }
                }
                cursor = last_cursor;
                if !has_next || cursor.is_none() || self.channels.is_full() {
                    break;
                }
            }
        }

        self.emit_channels_batch();
        Ok(())
    }

    async fn run_channel_switch(&mut self) -> Result<()> {
        // Manual mode pins the selection while the channel stays online.
        if let Some(manual_id) = self.manual_channel.clone() {
            let online = self
                .channels
                .get(&manual_id)
                .map(|c| c.online())
                .unwrap_or(false);
            if online {
                if self.channels.watching_id() != Some(manual_id.as_str()) {
                    self.switch_to(&manual_id).await?;
                }
                return Ok(());
            }
            self.bus
                .console("Manually selected channel went offline, resuming automatic selection");
            self.manual_channel = None;
            self.bus.emit(Event::ManualModeUpdate {
                active: false,
                game_name: None,
            });
        }

        let order = self.game_order();
        let target = self.channels.best_candidate(&order).map(|c| c.id.clone());

        match target {
            Some(id) if self.channels.watching_id() == Some(id.as_str()) => Ok(()),
            Some(id) => self.switch_to(&id).await,
            None => {
                if self.channels.watching_id().is_some() || self.watch.is_some() {
                    self.stop_watching(true);
                }
                self.bus.emit(Event::ChannelWatchingClear);
                self.bus.status("No live channels with wanted drops");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
