//! Campaign, drop and benefit domain model.
//!
//! Wire shapes mirror the GQL responses; the domain types own the invariants.
//! Cross-references (drop preconditions, campaign membership) are identifiers,
//! never owning handles, and every mutation goes through a typed operation on
//! the owning collection.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_EXTRA_MINUTES, MAX_PRECONDITION_DEPTH};
use crate::error::{AgentError, Result};

// =============================================================================
// Benefits and games
// =============================================================================

/// Reward category; anything the platform invents later degrades to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenefitKind {
    Item,
    Badge,
    Emote,
    #[serde(other)]
    Other,
}

impl BenefitKind {
    pub const ALL: [BenefitKind; 4] = [
        BenefitKind::Item,
        BenefitKind::Badge,
        BenefitKind::Emote,
        BenefitKind::Other,
    ];

    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("ITEM") => BenefitKind::Item,
            Some("BADGE") => BenefitKind::Badge,
            Some("EMOTE") => BenefitKind::Emote,
            _ => BenefitKind::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Benefit {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub kind: BenefitKind,
}

/// Which benefit kinds the user wants to mine for.
#[derive(Debug, Clone, Copy)]
pub struct BenefitGate {
    pub item: bool,
    pub badge: bool,
    pub emote: bool,
    pub other: bool,
}

impl BenefitGate {
    pub const ALL: BenefitGate = BenefitGate {
        item: true,
        badge: true,
        emote: true,
        other: true,
    };

    pub fn wants(self, kind: BenefitKind) -> bool {
        match kind {
            BenefitKind::Item => self.item,
            BenefitKind::Badge => self.badge,
            BenefitKind::Emote => self.emote,
            BenefitKind::Other => self.other,
        }
    }
}

/// A game on Twitch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    /// The display name - ViewerDropsDashboard uses "displayName", Inventory uses "name"
    #[serde(alias = "displayName", alias = "name", default)]
    pub display_name: String,
    #[serde(rename = "boxArtURL", default)]
    pub box_art_url: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

impl Game {
    /// Directory queries take a slug; fall back to a naive slugification of
    /// the display name when the wire did not provide one.
    pub fn directory_slug(&self) -> String {
        self.slug
            .clone()
            .unwrap_or_else(|| self.display_name.to_lowercase().replace(' ', "-"))
    }
}

// =============================================================================
// Campaign status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Upcoming,
    Active,
    Expired,
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WireBenefitEdge {
    pub benefit: WireBenefit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBenefit {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "imageAssetURL", default)]
    pub image_url: Option<String>,
    #[serde(rename = "distributionType", default)]
    pub distribution_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDropSelf {
    #[serde(rename = "currentMinutesWatched", default)]
    pub current_minutes_watched: u32,
    #[serde(rename = "isClaimed", default)]
    pub is_claimed: bool,
    #[serde(rename = "dropInstanceID", default)]
    pub drop_instance_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDropRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTimedDrop {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "requiredMinutesWatched", default)]
    pub required_minutes: u32,
    #[serde(rename = "benefitEdges", default)]
    pub benefit_edges: Vec<WireBenefitEdge>,
    #[serde(rename = "preconditionDrops", default)]
    pub precondition_drops: Option<Vec<WireDropRef>>,
    #[serde(rename = "self", default)]
    pub self_info: Option<WireDropSelf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCampaignSelf {
    #[serde(rename = "isAccountConnected", default)]
    pub is_account_connected: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAllow {
    #[serde(default)]
    pub channels: Option<Vec<WireAllowChannel>>,
    #[serde(rename = "isEnabled", default)]
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAllowChannel {
    pub id: String,
    #[serde(rename = "name", alias = "displayName", default)]
    pub name: Option<String>,
}

/// One allow-listed channel of an ACL-based campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclChannel {
    pub id: String,
    pub login: Option<String>,
}

/// A drops campaign as both ViewerDropsDashboard and Inventory report it.
#[derive(Debug, Clone, Deserialize)]
pub struct WireCampaign {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub game: Game,
    #[serde(rename = "startAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(rename = "endAt")]
    pub ends_at: DateTime<Utc>,
    #[serde(rename = "accountLinkURL", alias = "detailsURL", default)]
    pub link_url: Option<String>,
    /// Time-based drops - not included in the dashboard listing, only in the
    /// detailed view and the inventory.
    #[serde(rename = "timeBasedDrops", default)]
    pub time_based_drops: Vec<WireTimedDrop>,
    #[serde(rename = "self", default)]
    pub self_info: Option<WireCampaignSelf>,
    #[serde(default)]
    pub allow: Option<WireAllow>,
}

// =============================================================================
// Domain types
// =============================================================================

/// A timed drop within a campaign.
#[derive(Debug, Clone, Serialize)]
pub struct TimedDrop {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub required_minutes: u32,
    pub current_minutes: u32,
    pub is_claimed: bool,
    pub drop_instance_id: Option<String>,
    /// Identifier of the drop (same campaign) that must be claimed first.
    pub precondition: Option<String>,
    pub benefits: Vec<Benefit>,
    /// Locally extrapolated minutes since the last authoritative report.
    #[serde(skip)]
    extrapolated: u32,
}

impl TimedDrop {
    fn from_wire(wire: WireTimedDrop, campaign_id: &str) -> Self {
        let self_info = wire.self_info.unwrap_or(WireDropSelf {
            current_minutes_watched: 0,
            is_claimed: false,
            drop_instance_id: None,
        });
        let required = wire.required_minutes;
        Self {
            id: wire.id,
            campaign_id: campaign_id.to_string(),
            name: wire.name,
            required_minutes: required,
            current_minutes: self_info.current_minutes_watched.min(required),
            is_claimed: self_info.is_claimed,
            drop_instance_id: self_info.drop_instance_id,
            precondition: wire
                .precondition_drops
                .and_then(|refs| refs.into_iter().next())
                .map(|r| r.id),
            benefits: wire
                .benefit_edges
                .into_iter()
                .map(|edge| Benefit {
                    kind: BenefitKind::from_wire(edge.benefit.distribution_type.as_deref()),
                    id: edge.benefit.id,
                    name: edge.benefit.name,
                    image_url: edge.benefit.image_url,
                })
                .collect(),
            extrapolated: 0,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.required_minutes == 0 {
            return 1.0;
        }
        f64::from(self.current_minutes) / f64::from(self.required_minutes)
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.required_minutes.saturating_sub(self.current_minutes)
    }

    pub fn is_complete(&self) -> bool {
        self.current_minutes >= self.required_minutes
    }

    /// Complete but not yet claimed. Precondition eligibility is checked by
    /// the owning campaign, which can see sibling drops.
    pub fn can_claim(&self) -> bool {
        self.is_complete() && !self.is_claimed
    }

    /// Record a progress report. Non-authoritative reports may never move
    /// minutes backwards; an authoritative report snaps to the server value,
    /// which is the only legal regression.
    pub fn report_minutes(&mut self, minutes: u32, authoritative: bool) -> Result<bool> {
        if self.is_claimed {
            return Ok(false);
        }
        let clamped = minutes.min(self.required_minutes);
        if !authoritative && clamped < self.current_minutes {
            return Err(AgentError::Invariant(format!(
                "drop {} minutes would regress {} -> {clamped} without server authority",
                self.id, self.current_minutes
            )));
        }
        if authoritative {
            self.extrapolated = 0;
        }
        let changed = clamped != self.current_minutes;
        self.current_minutes = clamped;
        Ok(changed)
    }

    /// Local extrapolation tick; bounded so a dead realtime feed cannot run
    /// minutes arbitrarily far ahead of the server.
    pub fn bump_minute(&mut self) -> bool {
        if self.is_claimed || self.is_complete() || self.extrapolated >= MAX_EXTRA_MINUTES {
            return false;
        }
        self.current_minutes += 1;
        self.extrapolated += 1;
        true
    }

    /// Claiming is monotonic and implies full progress.
    pub fn mark_claimed(&mut self) {
        self.is_claimed = true;
        self.current_minutes = self.required_minutes;
        self.extrapolated = 0;
    }

    /// Whether any of this drop's benefits pass the user's benefit-type gate.
    pub fn wanted_by(&self, gate: BenefitGate) -> bool {
        if self.benefits.is_empty() {
            return gate.wants(BenefitKind::Other);
        }
        self.benefits.iter().any(|b| gate.wants(b.kind))
    }
}

/// A drops campaign.
#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub game: Game,
    pub link_url: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Whether the user's account is linked to the campaign's game account.
    pub linked: bool,
    /// When present the campaign is ACL-based.
    pub allow_list: Option<Vec<AclChannel>>,
    pub drops: Vec<TimedDrop>,
}

impl Campaign {
    pub fn from_wire(wire: WireCampaign) -> Result<Self> {
        if wire.starts_at > wire.ends_at {
            return Err(AgentError::Invariant(format!(
                "campaign {} starts after it ends",
                wire.id
            )));
        }
        let allow_list = wire.allow.and_then(|allow| {
            if !allow.is_enabled {
                return None;
            }
            allow
                .channels
                .map(|channels| {
                    channels
                        .into_iter()
                        .map(|c| AclChannel {
                            id: c.id,
                            login: c.name,
                        })
                        .collect::<Vec<_>>()
                })
                .filter(|entries: &Vec<AclChannel>| !entries.is_empty())
        });
        let drops = wire
            .time_based_drops
            .into_iter()
            .map(|d| TimedDrop::from_wire(d, &wire.id))
            .collect();
        Ok(Self {
            id: wire.id,
            name: wire.name,
            game: wire.game,
            link_url: wire.link_url.unwrap_or_default(),
            starts_at: wire.starts_at,
            ends_at: wire.ends_at,
            linked: wire
                .self_info
                .map(|s| s.is_account_connected)
                .unwrap_or(false),
            allow_list,
            drops,
        })
    }

    /// Status is derived from the time bounds, never cached.
    pub fn status(&self, now: DateTime<Utc>) -> CampaignStatus {
        if now < self.starts_at {
            CampaignStatus::Upcoming
        } else if now > self.ends_at {
            CampaignStatus::Expired
        } else {
            CampaignStatus::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == CampaignStatus::Active
    }

    pub fn acl_based(&self) -> bool {
        self.allow_list.is_some()
    }

    pub fn drop_by_id(&self, drop_id: &str) -> Option<&TimedDrop> {
        self.drops.iter().find(|d| d.id == drop_id)
    }

    pub fn drop_by_id_mut(&mut self, drop_id: &str) -> Option<&mut TimedDrop> {
        self.drops.iter_mut().find(|d| d.id == drop_id)
    }

    pub fn claimed_drops_count(&self) -> usize {
        self.drops.iter().filter(|d| d.is_claimed).count()
    }

    pub fn total_drops_count(&self) -> usize {
        self.drops.len()
    }

    /// Whether every transitive precondition of `drop_id` is claimed.
    /// Rejects cycles and chains deeper than the fixed cap.
    pub fn preconditions_met(&self, drop_id: &str) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut cursor = self
            .drop_by_id(drop_id)
            .ok_or_else(|| AgentError::Invariant(format!("unknown drop {drop_id}")))?;
        for _ in 0..MAX_PRECONDITION_DEPTH {
            let Some(pre_id) = cursor.precondition.as_deref() else {
                return Ok(true);
            };
            if !visited.insert(pre_id.to_string()) {
                return Err(AgentError::Invariant(format!(
                    "precondition cycle through drop {pre_id}"
                )));
            }
            let pre = self.drop_by_id(pre_id).ok_or_else(|| {
                AgentError::Invariant(format!("drop {drop_id} requires missing drop {pre_id}"))
            })?;
            if !pre.is_claimed {
                return Ok(false);
            }
            cursor = pre;
        }
        Err(AgentError::Invariant(format!(
            "precondition chain for drop {drop_id} exceeds depth {MAX_PRECONDITION_DEPTH}"
        )))
    }

    /// First unclaimed drop that is eligible (preconditions claimed) and
    /// passes the benefit gate. Broken chains simply disqualify the drop.
    pub fn first_wanted_drop(&self, gate: BenefitGate) -> Option<&TimedDrop> {
        self.drops.iter().find(|d| {
            !d.is_claimed
                && d.wanted_by(gate)
                && self.preconditions_met(&d.id).unwrap_or(false)
        })
    }

    pub fn has_wanted_drops(&self, gate: BenefitGate) -> bool {
        self.first_wanted_drop(gate).is_some()
    }

    pub fn ends_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.ends_at > now && self.ends_at - now <= window
    }

    /// Average of per-drop progress; claimed drops count as complete.
    pub fn progress(&self) -> f64 {
        if self.drops.is_empty() {
            return 0.0;
        }
        self.drops.iter().map(|d| d.progress()).sum::<f64>() / self.drops.len() as f64
    }
}

// =============================================================================
// Campaign arena
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
}

/// Owning collection for all campaigns; drops are addressed through it so
/// invariants live in one place. Campaigns are never removed during a
/// process, expired ones remain as history.
#[derive(Default)]
pub struct CampaignSet {
    campaigns: HashMap<String, Campaign>,
    drop_index: HashMap<String, String>,
}

impl CampaignSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Campaign> {
        self.campaigns.get(id)
    }

    /// Campaigns ordered by end time then id, for deterministic event output.
    pub fn ordered(&self) -> Vec<&Campaign> {
        let mut all: Vec<&Campaign> = self.campaigns.values().collect();
        all.sort_by(|a, b| a.ends_at.cmp(&b.ends_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Insert or refresh a campaign from a server snapshot. Server data is
    /// authoritative for minutes; a claim we already recorded never unwinds.
    pub fn upsert(&mut self, mut incoming: Campaign) -> UpsertOutcome {
        let outcome = match self.campaigns.get(&incoming.id) {
            Some(existing) => {
                for drop in &mut incoming.drops {
                    if let Some(old) = existing.drop_by_id(&drop.id) {
                        if old.is_claimed {
                            drop.mark_claimed();
                        }
                    }
                }
                // A listing without drop details must not wipe details we
                // already have from the inventory or a details fetch.
                if incoming.drops.is_empty() && !existing.drops.is_empty() {
                    incoming.drops = existing.drops.clone();
                }
                UpsertOutcome::Updated
            }
            None => UpsertOutcome::Added,
        };
        for drop in &incoming.drops {
            self.drop_index.insert(drop.id.clone(), incoming.id.clone());
        }
        self.campaigns.insert(incoming.id.clone(), incoming);
        outcome
    }

    pub fn find_drop(&self, drop_id: &str) -> Option<(&Campaign, &TimedDrop)> {
        let campaign = self.campaigns.get(self.drop_index.get(drop_id)?)?;
        let drop = campaign.drop_by_id(drop_id)?;
        Some((campaign, drop))
    }

    /// Typed progress mutation; routes through `TimedDrop::report_minutes`.
    pub fn report_progress(
        &mut self,
        drop_id: &str,
        minutes: u32,
        authoritative: bool,
    ) -> Result<bool> {
        let campaign_id = self
            .drop_index
            .get(drop_id)
            .cloned()
            .ok_or_else(|| AgentError::Invariant(format!("unknown drop {drop_id}")))?;
        let campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| AgentError::Invariant(format!("orphaned drop {drop_id}")))?;
        let drop = campaign
            .drop_by_id_mut(drop_id)
            .ok_or_else(|| AgentError::Invariant(format!("unindexed drop {drop_id}")))?;
        drop.report_minutes(minutes, authoritative)
    }

    /// Mark a drop claimed; idempotent.
    pub fn mark_claimed(&mut self, drop_id: &str) -> Result<bool> {
        let campaign_id = self
            .drop_index
            .get(drop_id)
            .cloned()
            .ok_or_else(|| AgentError::Invariant(format!("unknown drop {drop_id}")))?;
        let campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| AgentError::Invariant(format!("orphaned drop {drop_id}")))?;
        let drop = campaign
            .drop_by_id_mut(drop_id)
            .ok_or_else(|| AgentError::Invariant(format!("unindexed drop {drop_id}")))?;
        if drop.is_claimed {
            return Ok(false);
        }
        drop.mark_claimed();
        Ok(true)
    }

    pub fn bump_minute(&mut self, drop_id: &str) -> bool {
        let Some(campaign_id) = self.drop_index.get(drop_id).cloned() else {
            return false;
        };
        self.campaigns
            .get_mut(&campaign_id)
            .and_then(|c| c.drop_by_id_mut(drop_id))
            .map(|d| d.bump_minute())
            .unwrap_or(false)
    }

    /// Games that currently have an active campaign, deduplicated.
    pub fn active_games(&self, now: DateTime<Utc>) -> Vec<Game> {
        let mut seen = HashSet::new();
        let mut games = Vec::new();
        for campaign in self.ordered() {
            if campaign.is_active(now) && seen.insert(campaign.game.id.clone()) {
                games.push(campaign.game.clone());
            }
        }
        games
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn drop_with(
        id: &str,
        required: u32,
        current: u32,
        claimed: bool,
        precondition: Option<&str>,
    ) -> TimedDrop {
        TimedDrop {
            id: id.to_string(),
            campaign_id: "c1".to_string(),
            name: format!("Drop {id}"),
            required_minutes: required,
            current_minutes: current,
            is_claimed: claimed,
            drop_instance_id: Some(format!("{id}-instance")),
            precondition: precondition.map(String::from),
            benefits: vec![],
            extrapolated: 0,
        }
    }

    fn campaign_with(drops: Vec<TimedDrop>) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: "c1".to_string(),
            name: "Campaign".to_string(),
            game: Game {
                id: "g1".to_string(),
                display_name: "Game One".to_string(),
                box_art_url: None,
                slug: None,
            },
            link_url: String::new(),
            starts_at: now - Duration::days(1),
            ends_at: now + Duration::days(7),
            linked: true,
            allow_list: None,
            drops,
        }
    }

    #[test]
    fn test_wire_campaign_parsing() {
        let json = r#"{
            "id": "campaign-123",
            "name": "Test Campaign",
            "game": {"id": "game-456", "name": "Test Game"},
            "startAt": "2024-01-01T00:00:00Z",
            "endAt": "2024-12-31T23:59:59Z",
            "self": {"isAccountConnected": true},
            "allow": {"isEnabled": true, "channels": [{"id": "111"}, {"id": "222"}]},
            "timeBasedDrops": [{
                "id": "drop-1",
                "name": "First Drop",
                "requiredMinutesWatched": 30,
                "benefitEdges": [{"benefit": {"id": "b1", "name": "Skin", "imageAssetURL": null}}],
                "self": {"currentMinutesWatched": 10, "isClaimed": false, "dropInstanceID": "inst-1"}
            }]
        }"#;
        let wire: WireCampaign = serde_json::from_str(json).unwrap();
        let campaign = Campaign::from_wire(wire).unwrap();
        assert_eq!(campaign.id, "campaign-123");
        assert!(campaign.linked);
        assert!(campaign.acl_based());
        assert_eq!(campaign.allow_list.as_ref().unwrap().len(), 2);
        assert_eq!(campaign.drops[0].current_minutes, 10);
        assert_eq!(campaign.drops[0].benefits[0].kind, BenefitKind::Other);
    }

    #[test]
    fn test_from_wire_rejects_inverted_bounds() {
        let json = r#"{
            "id": "c", "name": "n",
            "game": {"id": "g", "name": "G"},
            "startAt": "2024-06-01T00:00:00Z",
            "endAt": "2024-01-01T00:00:00Z"
        }"#;
        let wire: WireCampaign = serde_json::from_str(json).unwrap();
        assert!(Campaign::from_wire(wire).is_err());
    }

    #[test]
    fn test_status_derivation() {
        let campaign = campaign_with(vec![]);
        let now = Utc::now();
        assert_eq!(campaign.status(now), CampaignStatus::Active);
        assert_eq!(
            campaign.status(now - Duration::days(3)),
            CampaignStatus::Upcoming
        );
        assert_eq!(
            campaign.status(now + Duration::days(30)),
            CampaignStatus::Expired
        );
    }

    #[test]
    fn test_report_minutes_rejects_local_regression() {
        let mut drop = drop_with("d1", 60, 30, false, None);
        assert!(drop.report_minutes(20, false).is_err());
        // Authoritative reports may regress; this is the snap-to-server case.
        assert!(drop.report_minutes(20, true).unwrap());
        assert_eq!(drop.current_minutes, 20);
    }

    #[test]
    fn test_report_minutes_clamps_to_required() {
        let mut drop = drop_with("d1", 60, 59, false, None);
        drop.report_minutes(500, true).unwrap();
        assert_eq!(drop.current_minutes, 60);
        assert!(drop.can_claim());
    }

    #[test]
    fn test_claimed_drop_ignores_reports() {
        let mut drop = drop_with("d1", 60, 60, true, None);
        assert!(!drop.report_minutes(0, true).unwrap());
        assert_eq!(drop.current_minutes, 60);
        assert!(drop.is_claimed);
    }

    #[test]
    fn test_bump_minute_is_bounded() {
        let mut drop = drop_with("d1", 100, 0, false, None);
        let mut bumps = 0;
        while drop.bump_minute() {
            bumps += 1;
        }
        assert_eq!(bumps, MAX_EXTRA_MINUTES);
        // An authoritative report resets the extrapolation budget.
        drop.report_minutes(40, true).unwrap();
        assert!(drop.bump_minute());
    }

    #[test]
    fn test_precondition_chain() {
        let campaign = campaign_with(vec![
            drop_with("d1", 10, 10, true, None),
            drop_with("d2", 20, 0, false, Some("d1")),
            drop_with("d3", 30, 0, false, Some("d2")),
        ]);
        assert!(campaign.preconditions_met("d1").unwrap());
        assert!(campaign.preconditions_met("d2").unwrap());
        // d3 waits on d2, which is not claimed yet.
        assert!(!campaign.preconditions_met("d3").unwrap());

        let wanted = campaign.first_wanted_drop(BenefitGate::ALL).unwrap();
        assert_eq!(wanted.id, "d2");
    }

    #[test]
    fn test_precondition_cycle_rejected() {
        let campaign = campaign_with(vec![
            drop_with("d1", 10, 0, false, Some("d2")),
            drop_with("d2", 10, 0, false, Some("d1")),
        ]);
        assert!(campaign.preconditions_met("d1").is_err());
        // A drop on a broken chain is never wanted.
        assert!(campaign.first_wanted_drop(BenefitGate::ALL).is_none());
    }

    #[test]
    fn test_benefit_gate_filters_wanted() {
        let mut badge = drop_with("d1", 10, 0, false, None);
        badge.benefits.push(Benefit {
            id: "b".into(),
            name: "Badge".into(),
            image_url: None,
            kind: BenefitKind::Badge,
        });
        let campaign = campaign_with(vec![badge]);
        let no_badges = BenefitGate {
            badge: false,
            ..BenefitGate::ALL
        };
        assert!(campaign.first_wanted_drop(no_badges).is_none());
        assert!(campaign.first_wanted_drop(BenefitGate::ALL).is_some());
    }

    #[test]
    fn test_campaign_set_upsert_preserves_claims_and_details() {
        let mut set = CampaignSet::new();
        let mut first = campaign_with(vec![drop_with("d1", 10, 10, false, None)]);
        first.drops[0].mark_claimed();
        assert_eq!(set.upsert(first), UpsertOutcome::Added);

        // Server snapshot lags behind the claim we already performed.
        let stale = campaign_with(vec![drop_with("d1", 10, 10, false, None)]);
        assert_eq!(set.upsert(stale), UpsertOutcome::Updated);
        let (_, drop) = set.find_drop("d1").unwrap();
        assert!(drop.is_claimed);

        // A dropless listing refresh must not erase known drops.
        let listing = campaign_with(vec![]);
        set.upsert(listing);
        assert!(set.find_drop("d1").is_some());
    }

    #[test]
    fn test_campaign_set_progress_and_claim_paths() {
        let mut set = CampaignSet::new();
        set.upsert(campaign_with(vec![drop_with("d1", 5, 4, false, None)]));

        assert!(set.report_progress("d1", 5, true).unwrap());
        let (_, drop) = set.find_drop("d1").unwrap();
        assert!(drop.can_claim());

        assert!(set.mark_claimed("d1").unwrap());
        // Second claim is a no-op, not an error.
        assert!(!set.mark_claimed("d1").unwrap());
        assert!(set.report_progress("missing", 1, true).is_err());
    }

    #[test]
    fn test_active_games_deduplicates(){
        let mut set = CampaignSet::new();
        let mut a = campaign_with(vec![]);
        a.id = "c-a".into();
        let mut b = campaign_with(vec![]);
        b.id = "c-b".into();
        set.upsert(a);
        set.upsert(b);
        assert_eq!(set.active_games(Utc::now()).len(), 1);
    }
}
