//! Core constants for the drops mining agent.
//!
//! Contains GQL operation definitions, PubSub topics, client identities,
//! and the tuning knobs for heartbeats, rate limits and the pubsub pool.

use std::time::Duration;

/// Base interval between watch heartbeats; divided by `connection_quality`.
pub const BASE_WATCH_INTERVAL: Duration = Duration::from_secs(20);

/// Extra slack after a heartbeat interval before local extrapolation kicks in.
pub const PROGRESS_SILENCE_GRACE: Duration = Duration::from_secs(20);

/// Interval between WebSocket PINGs
pub const PING_INTERVAL: Duration = Duration::from_secs(240); // 4 minutes

/// Jitter applied to each PING interval, +/- this much.
pub const PING_JITTER: Duration = Duration::from_secs(30);

/// How long to wait for a PONG before declaring the connection dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum WebSocket connections
pub const MAX_WEBSOCKETS: usize = 8;

/// Topics limit per WebSocket
pub const WS_TOPICS_LIMIT: usize = 50;

/// Hard cap on tracked channels (and thus channel topic subscriptions).
pub const MAX_CHANNELS: usize = 199;

/// Maximum extra minutes to extrapolate locally before forcing a refresh
pub const MAX_EXTRA_MINUTES: u32 = 15;

/// Maximum HTTP retry attempts for transient failures.
pub const MAX_HTTP_ATTEMPTS: u32 = 5;

/// Maximum operations in one batched GQL POST.
pub const GQL_BATCH_LIMIT: usize = 16;

/// Request deadlines.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
pub const GQL_TIMEOUT: Duration = Duration::from_secs(30);

/// Depth cap when walking drop precondition chains.
pub const MAX_PRECONDITION_DEPTH: usize = 32;

/// Debounce applied before re-running channel selection after a claim.
pub const POST_CLAIM_DEBOUNCE: Duration = Duration::from_millis(500);

/// Floor for the inventory refresh interval (minutes).
pub const MIN_REFRESH_INTERVAL_MINUTES: u64 = 5;

// =============================================================================
// Client Configuration
// =============================================================================

/// Client type configuration for Twitch API access.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_url: &'static str,
    pub client_id: &'static str,
    pub user_agent: &'static str,
}

/// Web client configuration (used for channel page scraping)
pub const CLIENT_WEB: ClientInfo = ClientInfo {
    client_url: "https://www.twitch.tv",
    client_id: "kimne78kx3ncx6brgo4mv6wki5h1ko",
    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
};

/// Android app client configuration - bypasses integrity checks!
pub const CLIENT_ANDROID_APP: ClientInfo = ClientInfo {
    client_url: "https://www.twitch.tv",
    client_id: "kd1unb4b3q4t58fwlpcbzcbnm76a8fp",
    user_agent: "Dalvik/2.1.0 (Linux; U; Android 16; SM-S911B Build/TP1A.220624.014) tv.twitch.android.app/25.3.0/2503006",
};

/// OAuth endpoints for the device-code flow.
pub const DEVICE_CODE_URL: &str = "https://id.twitch.tv/oauth2/device";
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

/// GraphQL endpoint.
pub const GQL_URL: &str = "https://gql.twitch.tv/gql";

/// PubSub endpoint.
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv/v1";

// =============================================================================
// GQL Operations
// =============================================================================

/// A GraphQL operation with its persisted query hash.
#[derive(Debug, Clone)]
pub struct GqlOperation {
    pub name: &'static str,
    pub sha256: &'static str,
}

impl GqlOperation {
    pub const fn new(name: &'static str, sha256: &'static str) -> Self {
        Self { name, sha256 }
    }
}

/// All GQL operations used by the agent.
/// The SHA256 hashes are required for Twitch's persisted query system.
pub mod gql_operations {
    use super::GqlOperation;

    /// Returns stream information for a particular channel
    pub const GET_STREAM_INFO: GqlOperation = GqlOperation::new(
        "VideoPlayerStreamInfoOverlayChannel",
        "198492e0857f6aedead9665c81c5a06d67b25b58034649687124083ff288597d",
    );

    /// Claim a drop reward
    pub const CLAIM_DROP: GqlOperation = GqlOperation::new(
        "DropsPage_ClaimDropRewards",
        "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
    );

    /// Returns all in-progress campaigns (inventory)
    pub const INVENTORY: GqlOperation = GqlOperation::new(
        "Inventory",
        "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b",
    );

    /// Returns current drop progress for a watched channel
    pub const CURRENT_DROP: GqlOperation = GqlOperation::new(
        "DropCurrentSessionContext",
        "4d06b702d25d652afb9ef835d2a550031f1cf762b193523a92166f40ea3d142b",
    );

    /// Returns all available campaigns
    pub const CAMPAIGNS: GqlOperation = GqlOperation::new(
        "ViewerDropsDashboard",
        "5a4da2ab3d5b47c9f9ce864e727b2cb346af1e3ea8b897fe8f704a97ff017619",
    );

    /// Returns extended information about a campaign
    pub const CAMPAIGN_DETAILS: GqlOperation = GqlOperation::new(
        "DropCampaignDetails",
        "039277bf98f3130929262cc7c6efd9c141ca3749cb6dca442fc8ead9a53f77c1",
    );

    /// Returns live channels for a game
    pub const GAME_DIRECTORY: GqlOperation = GqlOperation::new(
        "DirectoryPage_Game",
        "98a996c3c3ebb1ba4fd65d6671c6028d7ee8d615cb540b0731b3db2a911d3649",
    );

    /// Converts game name to game slug
    pub const SLUG_REDIRECT: GqlOperation = GqlOperation::new(
        "DirectoryGameRedirect",
        "1f0300090caceec51f33c5e20647aceff9017f740f223c3c532ba6fa59f6b6cc",
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info() {
        assert_eq!(CLIENT_WEB.client_id, "kimne78kx3ncx6brgo4mv6wki5h1ko");
        assert!(CLIENT_WEB.client_url.starts_with("https://"));
        assert!(CLIENT_ANDROID_APP
            .user_agent
            .contains("tv.twitch.android.app"));
    }

    #[test]
    fn test_gql_operations_hashes() {
        assert_eq!(
            gql_operations::INVENTORY.sha256,
            "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b"
        );
        assert_eq!(
            gql_operations::CLAIM_DROP.sha256,
            "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930"
        );
        assert_eq!(
            gql_operations::GET_STREAM_INFO.sha256,
            "198492e0857f6aedead9665c81c5a06d67b25b58034649687124083ff288597d"
        );
    }

    #[test]
    fn test_intervals() {
        assert_eq!(BASE_WATCH_INTERVAL.as_secs(), 20);
        assert_eq!(PING_INTERVAL.as_secs(), 240);
        assert!(PONG_TIMEOUT < PING_INTERVAL);
    }

    #[test]
    fn test_pool_limits() {
        // All channel topics must fit in the pool even at the channel cap.
        assert!(MAX_WEBSOCKETS * WS_TOPICS_LIMIT >= MAX_CHANNELS * 2);
    }
}
