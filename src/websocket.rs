//! Sharded WebSocket pool for Twitch PubSub.
//!
//! Each connection carries at most 50 topics; the pool opens connections as
//! topics arrive and queues subscriptions past the channel cap. Connections
//! ping on a jittered four-minute cadence and reconnect independently with
//! backoff, preserving their topic sets. Decoded events are pushed to a
//! single queue consumed by the state machine; ordering is preserved per
//! connection only.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::auth::SharedAuth;
use crate::backoff::Backoff;
use crate::constants::{
    MAX_CHANNELS, MAX_WEBSOCKETS, PING_INTERVAL, PING_JITTER, PONG_TIMEOUT, PUBSUB_URL,
    WS_TOPICS_LIMIT,
};
use crate::models::Game;

/// How often a connection checks its pong deadline and auth-retry queue.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before re-subscribing a topic that failed authorization.
const AUTH_RETRY_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// Topics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    UserDrops,
    UserNotifications,
    StreamState,
    StreamUpdate,
}

impl TopicKind {
    pub const CHANNEL_KINDS: [TopicKind; 2] = [TopicKind::StreamState, TopicKind::StreamUpdate];
    pub const USER_KINDS: [TopicKind; 2] = [TopicKind::UserDrops, TopicKind::UserNotifications];

    pub fn prefix(self) -> &'static str {
        match self {
            TopicKind::UserDrops => "user-drop-events",
            TopicKind::UserNotifications => "onsite-notifications",
            TopicKind::StreamState => "video-playback-by-id",
            TopicKind::StreamUpdate => "broadcast-settings-update",
        }
    }

    pub fn is_user_scoped(self) -> bool {
        matches!(self, TopicKind::UserDrops | TopicKind::UserNotifications)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "user-drop-events" => Some(TopicKind::UserDrops),
            "onsite-notifications" => Some(TopicKind::UserNotifications),
            "video-playback-by-id" => Some(TopicKind::StreamState),
            "broadcast-settings-update" => Some(TopicKind::StreamUpdate),
            _ => None,
        }
    }
}

/// A pubsub subscription: kind plus target (user id or channel id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub target: String,
}

impl Topic {
    pub fn new(kind: TopicKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, target) = raw.split_once('.')?;
        Some(Self {
            kind: TopicKind::from_prefix(prefix)?,
            target: target.to_string(),
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.prefix(), self.target)
    }
}

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum OutgoingMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "LISTEN")]
    Listen { nonce: String, data: ListenData },
    #[serde(rename = "UNLISTEN")]
    Unlisten { nonce: String, data: UnlistenData },
}

#[derive(Debug, Clone, Serialize)]
struct ListenData {
    topics: Vec<String>,
    auth_token: String,
}

#[derive(Debug, Clone, Serialize)]
struct UnlistenData {
    topics: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct IncomingMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<MessageData>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageData {
    topic: String,
    message: String,
}

// =============================================================================
// Decoded events
// =============================================================================

/// A platform event decoded from a pubsub message.
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// Authoritative drop progress for the logged-in user.
    DropProgress {
        drop_id: String,
        current_minutes: u32,
        at: DateTime<Utc>,
    },
    /// A drop instance became claimable (or was just claimed server-side).
    DropClaim {
        drop_instance_id: String,
        drop_id: Option<String>,
    },
    StreamUp {
        channel_id: String,
    },
    StreamDown {
        channel_id: String,
    },
    ViewersUpdate {
        channel_id: String,
        viewers: u64,
    },
    /// Broadcast settings changed; the game may have rotated.
    BroadcastUpdate {
        channel_id: String,
        game: Option<Game>,
    },
}

/// Decode one pubsub payload. Returns None for shapes we do not care about;
/// the caller logs and drops undecodable input.
fn decode_event(topic: &Topic, message: &str) -> Option<PubSubEvent> {
    let value: Value = serde_json::from_str(message).ok()?;
    match topic.kind {
        TopicKind::UserDrops => match value["type"].as_str()? {
            "drop-progress" => Some(PubSubEvent::DropProgress {
                drop_id: value["data"]["drop_id"].as_str()?.to_string(),
                current_minutes: value["data"]["current_progress_min"].as_u64()? as u32,
                at: Utc::now(),
            }),
            "drop-claim" => Some(PubSubEvent::DropClaim {
                drop_instance_id: value["data"]["drop_instance_id"].as_str()?.to_string(),
                drop_id: value["data"]["drop_id"].as_str().map(String::from),
            }),
            _ => None,
        },
        TopicKind::UserNotifications => {
            // Drop-ready notifications carry the instance id under a nested
            // notification payload.
            let notification = &value["data"]["notification"];
            if notification["type"].as_str() == Some("user_drop_reward_reminder_notification") {
                return Some(PubSubEvent::DropClaim {
                    drop_instance_id: notification["data"]["drop_instance_id"]
                        .as_str()?
                        .to_string(),
                    drop_id: None,
                });
            }
            None
        }
        TopicKind::StreamState => match value["type"].as_str()? {
            "stream-up" => Some(PubSubEvent::StreamUp {
                channel_id: topic.target.clone(),
            }),
            "stream-down" => Some(PubSubEvent::StreamDown {
                channel_id: topic.target.clone(),
            }),
            "viewcount" => Some(PubSubEvent::ViewersUpdate {
                channel_id: topic.target.clone(),
                viewers: value["viewers"].as_u64()?,
            }),
            _ => None,
        },
        TopicKind::StreamUpdate => {
            let game = value["game_id"].as_str().map(|id| Game {
                id: id.to_string(),
                display_name: value["game"].as_str().unwrap_or_default().to_string(),
                box_art_url: None,
                slug: None,
            });
            Some(PubSubEvent::BroadcastUpdate {
                channel_id: topic.target.clone(),
                game,
            })
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Debug)]
enum ShardCommand {
    Listen(Vec<Topic>),
    Unlisten(Vec<Topic>),
    Shutdown,
}

struct Shard {
    cmd_tx: mpsc::UnboundedSender<ShardCommand>,
    topics: HashSet<Topic>,
    handle: tokio::task::JoinHandle<()>,
}

/// Owner of all pubsub connections. Lives on the state-machine task; shard
/// tasks only touch their own sockets and the shared event queue.
pub struct PubSubPool {
    shards: Vec<Shard>,
    assigned: HashSet<Topic>,
    pending: VecDeque<Topic>,
    event_tx: mpsc::Sender<PubSubEvent>,
    auth: SharedAuth,
}

impl PubSubPool {
    pub fn new(auth: SharedAuth, event_tx: mpsc::Sender<PubSubEvent>) -> Self {
        Self {
            shards: Vec::new(),
            assigned: HashSet::new(),
            pending: VecDeque::new(),
            event_tx,
            auth,
        }
    }

    pub fn topic_count(&self) -> usize {
        self.assigned.len()
    }

    /// Distinct channels among the live channel-scoped subscriptions.
    fn live_channel_count(&self) -> usize {
        self.assigned
            .iter()
            .filter(|t| !t.kind.is_user_scoped())
            .map(|t| t.target.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Whether a channel-scoped topic would add a new channel past the cap.
    fn over_channel_cap(&self, topic: &Topic) -> bool {
        if topic.kind.is_user_scoped() {
            return false;
        }
        let already_live = self
            .assigned
            .iter()
            .any(|t| !t.kind.is_user_scoped() && t.target == topic.target);
        !already_live && self.live_channel_count() >= MAX_CHANNELS
    }

    /// Subscribe to a set of topics. Channel topics beyond the channel cap
    /// are queued and picked up as capacity frees.
    pub fn subscribe(&mut self, topics: Vec<Topic>) {
        for topic in topics {
            if self.assigned.contains(&topic) || self.pending.contains(&topic) {
                continue;
            }
            if self.over_channel_cap(&topic) {
                tracing::info!("channel cap reached, queueing subscription {topic}");
                self.pending.push_back(topic);
                continue;
            }
            self.assign(topic);
        }
    }

    fn assign(&mut self, topic: Topic) {
        // First shard with spare topic room wins.
        if let Some(shard) = self.shards.iter_mut().find(|s| s.topics.len() < WS_TOPICS_LIMIT) {
            shard.topics.insert(topic.clone());
            self.assigned.insert(topic.clone());
            let _ = shard.cmd_tx.send(ShardCommand::Listen(vec![topic]));
            return;
        }
        if self.shards.len() < MAX_WEBSOCKETS {
            let shard = spawn_shard(self.shards.len(), self.auth.clone(), self.event_tx.clone());
            self.shards.push(shard);
            self.assign(topic);
            return;
        }
        tracing::warn!("pubsub pool saturated, queueing {topic}");
        self.pending.push_back(topic);
    }

    /// Unsubscribe topics and promote queued ones into the freed capacity.
    pub fn unsubscribe(&mut self, topics: &[Topic]) {
        for shard in &mut self.shards {
            let owned: Vec<Topic> = topics
                .iter()
                .filter(|t| shard.topics.remove(*t))
                .cloned()
                .collect();
            if !owned.is_empty() {
                let _ = shard.cmd_tx.send(ShardCommand::Unlisten(owned));
            }
        }
        for topic in topics {
            self.assigned.remove(topic);
            self.pending.retain(|t| t != topic);
        }
        while let Some(topic) = self.pending.pop_front() {
            if self.over_channel_cap(&topic) {
                self.pending.push_front(topic);
                break;
            }
            self.assign(topic);
        }
    }

    /// Drop every subscription tied to a channel id.
    pub fn unsubscribe_channel(&mut self, channel_id: &str) {
        let topics: Vec<Topic> = TopicKind::CHANNEL_KINDS
            .iter()
            .map(|kind| Topic::new(*kind, channel_id))
            .collect();
        self.unsubscribe(&topics);
    }

    /// Tear the pool down; shard tasks close their sockets and exit.
    pub fn shutdown(&mut self) {
        for shard in &self.shards {
            let _ = shard.cmd_tx.send(ShardCommand::Shutdown);
        }
        for shard in self.shards.drain(..) {
            shard.handle.abort();
        }
        self.assigned.clear();
        self.pending.clear();
    }
}

// =============================================================================
// Shard task
// =============================================================================

fn spawn_shard(index: usize, auth: SharedAuth, event_tx: mpsc::Sender<PubSubEvent>) -> Shard {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(shard_loop(index, auth, event_tx, cmd_rx));
    Shard {
        cmd_tx,
        topics: HashSet::new(),
        handle,
    }
}

fn jittered_ping_interval() -> Duration {
    let jitter = rand::rng().random_range(0..=PING_JITTER.as_secs() * 2) as i64
        - PING_JITTER.as_secs() as i64;
    Duration::from_secs((PING_INTERVAL.as_secs() as i64 + jitter).max(1) as u64)
}

fn listen_message(topics: &[Topic], auth: &SharedAuth) -> OutgoingMessage {
    let token = auth
        .read()
        .expect("auth lock poisoned")
        .access_token
        .clone()
        .unwrap_or_default();
    OutgoingMessage::Listen {
        nonce: Uuid::new_v4().simple().to_string(),
        data: ListenData {
            topics: topics.iter().map(Topic::to_string).collect(),
            auth_token: token,
        },
    }
}

/// One connection's lifetime: connect, replay the topic set, pump messages;
/// on failure, back off and reconnect with the same topics.
async fn shard_loop(
    index: usize,
    auth: SharedAuth,
    event_tx: mpsc::Sender<PubSubEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<ShardCommand>,
) {
    let backoff = Backoff::websocket();
    let mut attempt: u32 = 0;
    let mut topics: HashSet<Topic> = HashSet::new();
    let mut had_connection = false;

    'reconnect: loop {
        // Soak up commands that arrived while disconnected.
        loop {
            match cmd_rx.try_recv() {
                Ok(ShardCommand::Listen(new)) => topics.extend(new),
                Ok(ShardCommand::Unlisten(old)) => {
                    for t in &old {
                        topics.remove(t);
                    }
                }
                Ok(ShardCommand::Shutdown) => return,
                Err(_) => break,
            }
        }

        // A dropped live connection still backs off before redialing.
        if had_connection {
            had_connection = false;
            backoff.wait(0).await;
        }

        let (ws, _) = match connect_async(PUBSUB_URL).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!("pubsub[{index}] connect failed: {e}");
                attempt = attempt.saturating_add(1);
                backoff.wait(attempt - 1).await;
                continue;
            }
        };
        tracing::info!("pubsub[{index}] connected ({} topics)", topics.len());
        attempt = 0;
        had_connection = true;

        let (mut write, mut read) = ws.split();

        if !topics.is_empty() {
            let replay: Vec<Topic> = topics.iter().cloned().collect();
            let msg = listen_message(&replay, &auth);
            if let Ok(json) = serde_json::to_string(&msg) {
                if write.send(Message::Text(json)).await.is_err() {
                    continue 'reconnect;
                }
            }
        }

        let mut next_ping = Instant::now() + jittered_ping_interval();
        let mut awaiting_pong: Option<Instant> = None;
        let mut auth_retries: Vec<(Instant, Vec<Topic>)> = Vec::new();
        let mut last_listen: Vec<Topic> = topics.iter().cloned().collect();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_ping) => {
                    let json = match serde_json::to_string(&OutgoingMessage::Ping) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if write.send(Message::Text(json)).await.is_err() {
                        continue 'reconnect;
                    }
                    awaiting_pong = Some(Instant::now());
                    next_ping = Instant::now() + jittered_ping_interval();
                }
                _ = housekeeping.tick() => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() > PONG_TIMEOUT {
                            tracing::warn!("pubsub[{index}] missed PONG, reconnecting");
                            continue 'reconnect;
                        }
                    }
                    let now = Instant::now();
                    let due: Vec<Vec<Topic>> = {
                        let (ready, waiting): (Vec<_>, Vec<_>) =
                            auth_retries.drain(..).partition(|(at, _)| *at <= now);
                        auth_retries = waiting;
                        ready.into_iter().map(|(_, t)| t).collect()
                    };
                    for retry in due {
                        let live: Vec<Topic> = retry.into_iter().filter(|t| topics.contains(t)).collect();
                        if live.is_empty() {
                            continue;
                        }
                        tracing::info!("pubsub[{index}] retrying auth for {} topics", live.len());
                        last_listen = live.clone();
                        let msg = listen_message(&live, &auth);
                        if let Ok(json) = serde_json::to_string(&msg) {
                            if write.send(Message::Text(json)).await.is_err() {
                                continue 'reconnect;
                            }
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ShardCommand::Listen(new)) => {
                            let fresh: Vec<Topic> = new
                                .into_iter()
                                .filter(|t| topics.insert(t.clone()))
                                .collect();
                            if fresh.is_empty() {
                                continue;
                            }
                            last_listen = fresh.clone();
                            let msg = listen_message(&fresh, &auth);
                            if let Ok(json) = serde_json::to_string(&msg) {
                                if write.send(Message::Text(json)).await.is_err() {
                                    continue 'reconnect;
                                }
                            }
                        }
                        Some(ShardCommand::Unlisten(old)) => {
                            let removed: Vec<String> = old
                                .iter()
                                .filter(|t| topics.remove(*t))
                                .map(Topic::to_string)
                                .collect();
                            if removed.is_empty() {
                                continue;
                            }
                            let msg = OutgoingMessage::Unlisten {
                                nonce: Uuid::new_v4().simple().to_string(),
                                data: UnlistenData { topics: removed },
                            };
                            if let Ok(json) = serde_json::to_string(&msg) {
                                if write.send(Message::Text(json)).await.is_err() {
                                    continue 'reconnect;
                                }
                            }
                        }
                        Some(ShardCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let parsed: IncomingMessage = match serde_json::from_str(&text) {
                                Ok(parsed) => parsed,
                                Err(e) => {
                                    tracing::debug!("pubsub[{index}] undecodable frame dropped: {e}");
                                    continue;
                                }
                            };
                            match parsed.msg_type.as_str() {
                                "PONG" => awaiting_pong = None,
                                "RECONNECT" => {
                                    tracing::info!("pubsub[{index}] server requested reconnect");
                                    continue 'reconnect;
                                }
                                "RESPONSE" => {
                                    if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
                                        tracing::warn!(
                                            "pubsub[{index}] subscribe rejected ({error}), retrying with fresh token"
                                        );
                                        auth_retries.push((
                                            Instant::now() + AUTH_RETRY_DELAY,
                                            last_listen.clone(),
                                        ));
                                    }
                                }
                                "MESSAGE" => {
                                    let Some(data) = parsed.data else { continue };
                                    let Some(topic) = Topic::parse(&data.topic) else {
                                        tracing::debug!("pubsub[{index}] unknown topic {}", data.topic);
                                        continue;
                                    };
                                    match decode_event(&topic, &data.message) {
                                        Some(event) => {
                                            if event_tx.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                        None => {
                                            tracing::debug!(
                                                "pubsub[{index}] unhandled payload on {topic}"
                                            );
                                        }
                                    }
                                }
                                other => tracing::debug!("pubsub[{index}] unknown frame type {other}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("pubsub[{index}] connection closed");
                            continue 'reconnect;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("pubsub[{index}] read error: {e}");
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthState;

    #[test]
    fn test_topic_formatting_and_parse() {
        let topic = Topic::new(TopicKind::UserDrops, "12345678");
        assert_eq!(topic.to_string(), "user-drop-events.12345678");

        let parsed = Topic::parse("video-playback-by-id.87654321").unwrap();
        assert_eq!(parsed.kind, TopicKind::StreamState);
        assert_eq!(parsed.target, "87654321");

        assert!(Topic::parse("garbage").is_none());
        assert!(Topic::parse("unknown-topic.1").is_none());
    }

    #[test]
    fn test_outgoing_listen_serialization() {
        let auth = AuthState::shared_for_tests("token123", 1, "device");
        let msg = listen_message(&[Topic::new(TopicKind::UserDrops, "12345")], &auth);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "LISTEN");
        assert_eq!(json["data"]["topics"][0], "user-drop-events.12345");
        assert_eq!(json["data"]["auth_token"], "token123");
        assert!(!json["nonce"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_outgoing_ping_serialization() {
        let json = serde_json::to_string(&OutgoingMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"PING"}"#);
    }

    #[test]
    fn test_decode_drop_progress() {
        let topic = Topic::new(TopicKind::UserDrops, "1");
        let event = decode_event(
            &topic,
            r#"{"type":"drop-progress","data":{"drop_id":"drop123","current_progress_min":30}}"#,
        )
        .unwrap();
        match event {
            PubSubEvent::DropProgress {
                drop_id,
                current_minutes,
                ..
            } => {
                assert_eq!(drop_id, "drop123");
                assert_eq!(current_minutes, 30);
            }
            other => panic!("expected DropProgress, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_stream_events() {
        let topic = Topic::new(TopicKind::StreamState, "98765");
        match decode_event(&topic, r#"{"type":"stream-up"}"#).unwrap() {
            PubSubEvent::StreamUp { channel_id } => assert_eq!(channel_id, "98765"),
            other => panic!("expected StreamUp, got {other:?}"),
        }
        match decode_event(&topic, r#"{"type":"viewcount","viewers":4321}"#).unwrap() {
            PubSubEvent::ViewersUpdate { viewers, .. } => assert_eq!(viewers, 4321),
            other => panic!("expected ViewersUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_is_dropped() {
        let topic = Topic::new(TopicKind::UserDrops, "1");
        assert!(decode_event(&topic, "not json").is_none());
        assert!(decode_event(&topic, r#"{"type":"unknown-kind"}"#).is_none());
    }

    #[test]
    fn test_ping_jitter_window() {
        for _ in 0..100 {
            let interval = jittered_ping_interval();
            assert!(interval >= PING_INTERVAL - PING_JITTER);
            assert!(interval <= PING_INTERVAL + PING_JITTER);
        }
    }

    #[tokio::test]
    async fn test_pool_respects_per_connection_topic_limit() {
        let auth = AuthState::shared_for_tests("t", 1, "d");
        let (tx, _rx) = mpsc::channel(16);
        let mut pool = PubSubPool::new(auth, tx);

        // 70 channel-state topics need two shards at 50 per connection.
        let topics: Vec<Topic> = (0..70)
            .map(|i| Topic::new(TopicKind::StreamState, format!("ch{i}")))
            .collect();
        pool.subscribe(topics);

        assert_eq!(pool.topic_count(), 70);
        assert_eq!(pool.shards.len(), 2);
        for shard in &pool.shards {
            assert!(shard.topics.len() <= WS_TOPICS_LIMIT);
        }
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_pool_queues_past_channel_cap() {
        let auth = AuthState::shared_for_tests("t", 1, "d");
        let (tx, _rx) = mpsc::channel(16);
        let mut pool = PubSubPool::new(auth, tx);

        let topics: Vec<Topic> = (0..MAX_CHANNELS + 10)
            .map(|i| Topic::new(TopicKind::StreamState, format!("ch{i}")))
            .collect();
        pool.subscribe(topics);

        assert_eq!(pool.topic_count(), MAX_CHANNELS);
        assert_eq!(pool.pending.len(), 10);

        // Freeing one channel promotes one queued subscription.
        pool.unsubscribe_channel("ch0");
        assert_eq!(pool.topic_count(), MAX_CHANNELS);
        assert_eq!(pool.pending.len(), 9);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_pool_dedupes_subscriptions() {
        let auth = AuthState::shared_for_tests("t", 1, "d");
        let (tx, _rx) = mpsc::channel(16);
        let mut pool = PubSubPool::new(auth, tx);

        let topic = Topic::new(TopicKind::UserDrops, "42");
        pool.subscribe(vec![topic.clone(), topic.clone()]);
        pool.subscribe(vec![topic]);
        assert_eq!(pool.topic_count(), 1);
        pool.shutdown();
    }
}
