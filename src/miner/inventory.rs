//! Inventory phase: fetch campaigns, reconcile the model, claim what's due.

use serde_json::{json, Value};
use tokio::time::Instant;

use crate::constants::{gql_operations, GQL_BATCH_LIMIT};
use crate::error::{AgentError, Result};
use crate::events::{CampaignSummary, DropSummary, Event};
use crate::miner::Miner;
use crate::models::{Campaign, GqlRequest, UpsertOutcome, WireCampaign};

#[allow(async_fn_in_trait)]
pub trait InventoryOps {
    /// The INVENTORY_FETCH phase. `force` bypasses the refresh floor.
    async fn run_inventory_phase(&mut self, force: bool) -> Result<()>;
    /// Claim one completed drop; true when a claim actually happened.
    async fn claim_drop(&mut self, drop_id: &str) -> Result<bool>;
    /// Sweep every campaign for completed-but-unclaimed drops.
    async fn claim_completed_drops(&mut self) -> Result<usize>;
}

/// Pull a list of wire campaigns out of a response at the given path.
fn campaigns_at<'a>(data: &'a Value, path: &[&str]) -> Vec<&'a Value> {
    let mut cursor = data;
    for key in path {
        cursor = &cursor[*key];
    }
    cursor.as_array().map(|v| v.iter().collect()).unwrap_or_default()
}

impl Miner {
    /// Parse and absorb one wire campaign; emits `campaign_add` for new ones.
    fn absorb_campaign(&mut self, raw: &Value) -> Option<String> {
        let wire: WireCampaign = match serde_json::from_value(raw.clone()) {
            Ok(wire) => wire,
            Err(e) => {
                let name = raw["name"].as_str().unwrap_or("<unnamed>");
                tracing::warn!("skipping unparseable campaign '{name}': {e}");
                return None;
            }
        };
        let campaign = match Campaign::from_wire(wire) {
            Ok(campaign) => campaign,
            Err(e) => {
                tracing::warn!("skipping invalid campaign: {e}");
                return None;
            }
        };
        let id = campaign.id.clone();
        match self.campaigns.upsert(campaign) {
            UpsertOutcome::Added => {
                let summary = CampaignSummary::from(self.campaigns.get(&id).expect("just inserted"));
                self.bus.emit(Event::CampaignAdd { campaign: summary });
            }
            UpsertOutcome::Updated => {}
        }
        // Judge after the upsert: a listing refresh of a campaign whose
        // drops we already hold needs no details fetch.
        let needs_details = self
            .campaigns
            .get(&id)
            .map(|c| c.drops.is_empty() && c.is_active(chrono::Utc::now()))
            .unwrap_or(false);
        needs_details.then_some(id)
    }
}

impl InventoryOps for Miner {
    async fn run_inventory_phase(&mut self, force: bool) -> Result<()> {
        let floor =
            std::time::Duration::from_secs(self.settings.minimum_refresh_interval_minutes * 60);
        if !force {
            if let Some(at) = self.last_inventory_fetch {
                if at.elapsed() < floor {
                    tracing::debug!("inventory refresh inside the floor, skipping fetch");
                    return Ok(());
                }
            }
        }

        self.bus.status("Fetching inventory");

        // In-progress campaigns and the full dashboard in one batched call.
        let batch = vec![
            GqlRequest::new(
                &gql_operations::INVENTORY,
                Some(json!({"fetchRewardCampaigns": true})),
            ),
            GqlRequest::new(
                &gql_operations::CAMPAIGNS,
                Some(json!({"fetchRewardCampaigns": false})),
            ),
        ];
        let mut results = self.http.gql_batch(batch).await?;
        let dashboard = results.pop().expect("two results")?;
        let inventory = results.pop().expect("two results")?;

        let mut detail_ids: Vec<String> = Vec::new();
        for raw in campaigns_at(
            &inventory,
            &["currentUser", "inventory", "dropCampaignsInProgress"],
        ) {
            if let Some(id) = self.absorb_campaign(raw) {
                detail_ids.push(id);
            }
        }
        for raw in campaigns_at(&dashboard, &["currentUser", "dropCampaigns"]) {
            if let Some(id) = self.absorb_campaign(raw) {
                if !detail_ids.contains(&id) {
                    detail_ids.push(id);
                }
            }
        }

        // Newly observed campaigns arrive without drop details; backfill in
        // batches of at most 16 operations.
        for chunk in detail_ids.chunks(GQL_BATCH_LIMIT) {
            let requests: Vec<GqlRequest> = chunk
                .iter()
                .map(|id| {
                    GqlRequest::new(
                        &gql_operations::CAMPAIGN_DETAILS,
                        Some(json!({"dropID": id, "channelLogin": ""})),
                    )
                })
                .collect();
            match self.http.gql_batch(requests).await {
                Ok(results) => {
                    for result in results {
                        match result {
                            Ok(data) => {
                                let raw = &data["user"]["dropCampaign"];
                                if !raw.is_null() {
                                    self.absorb_campaign(raw);
                                }
                            }
                            Err(e) => tracing::warn!("campaign details lookup failed: {e}"),
                        }
                    }
                }
                Err(e) => tracing::warn!("campaign details batch failed: {e}"),
            }
        }

        let claimed = self.claim_completed_drops().await?;
        if claimed > 0 {
            self.bus
                .console(format!("Claimed {claimed} finished drop(s) during refresh"));
        }

        self.last_inventory_fetch = Some(Instant::now());
        self.emit_inventory_batch();
        self.bus.status(format!(
            "Tracking {} campaign(s)",
            self.campaigns.len()
        ));
        Ok(())
    }

    async fn claim_drop(&mut self, drop_id: &str) -> Result<bool> {
        let Some((campaign, drop)) = self.campaigns.find_drop(drop_id) else {
            return Err(AgentError::Invariant(format!("unknown drop {drop_id}")));
        };
        if drop.is_claimed || !drop.can_claim() {
            return Ok(false);
        }
        if !campaign.preconditions_met(drop_id).unwrap_or(false) {
            tracing::debug!("drop {drop_id} complete but gated by a precondition");
            return Ok(false);
        }
        let Some(instance_id) = drop.drop_instance_id.clone() else {
            // Completed but no instance id: the account is not linked to the
            // campaign, so the platform will never hand the reward over.
            self.bus.console(format!(
                "Cannot claim '{}': account not linked to {}",
                drop.name, campaign.game.display_name
            ));
            return Ok(false);
        };
        let campaign_id = campaign.id.clone();
        let drop_name = drop.name.clone();
        let game_name = campaign.game.display_name.clone();

        self.http
            .gql(
                &gql_operations::CLAIM_DROP,
                Some(json!({"input": {"dropInstanceID": instance_id}})),
            )
            .await?;
        let changed = self.campaigns.mark_claimed(drop_id)?;
        if changed {
            self.bus
                .console(format!("Drop claimed: {drop_name} ({game_name})"));
            if let Some((_, drop)) = self.campaigns.find_drop(drop_id) {
                self.bus.emit(Event::DropUpdate {
                    campaign_id,
                    drop: DropSummary::from(drop),
                });
            }
        }
        Ok(changed)
    }

    async fn claim_completed_drops(&mut self) -> Result<usize> {
        // Collect ids first; claims mutate the set and may unlock successors,
        // so keep sweeping until a pass claims nothing.
        let mut total = 0;
        loop {
            let claimable: Vec<String> = self
                .campaigns
                .ordered()
                .iter()
                .flat_map(|c| {
                    c.drops
                        .iter()
                        .filter(|d| d.can_claim() && c.preconditions_met(&d.id).unwrap_or(false))
                        .map(|d| d.id.clone())
                        .collect::<Vec<_>>()
                })
                .collect();
            if claimable.is_empty() {
                break;
            }
            let mut claimed_this_pass = 0;
            for drop_id in claimable {
                match self.claim_drop(&drop_id).await {
                    Ok(true) => claimed_this_pass += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("claim of {drop_id} failed: {e}"),
                }
            }
            if claimed_this_pass == 0 {
                break;
            }
            total += claimed_this_pass;
        }
        Ok(total)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::tests::test_miner;

    fn wire_campaign_json(id: &str, drops: Value) -> Value {
        json!({
            "id": id,
            "name": format!("Campaign {id}"),
            "game": {"id": "g1", "name": "Game One"},
            "startAt": "2024-01-01T00:00:00Z",
            "endAt": "2099-12-31T23:59:59Z",
            "self": {"isAccountConnected": true},
            "timeBasedDrops": drops
        })
    }

    #[tokio::test]
    async fn test_absorb_campaign_adds_once() {
        let mut miner = test_miner();
        let raw = wire_campaign_json(
            "c1",
            json!([{
                "id": "d1",
                "name": "Drop",
                "requiredMinutesWatched": 30,
                "self": {"currentMinutesWatched": 0, "isClaimed": false, "dropInstanceID": null}
            }]),
        );
        let needs_details = miner.absorb_campaign(&raw);
        // Campaign came with drops, no details needed.
        assert!(needs_details.is_none());
        assert_eq!(miner.campaigns.len(), 1);

        // Re-absorbing updates in place.
        miner.absorb_campaign(&raw);
        assert_eq!(miner.campaigns.len(), 1);
    }

    #[tokio::test]
    async fn test_absorb_dropless_campaign_requests_details() {
        let mut miner = test_miner();
        let raw = wire_campaign_json("c2", json!([]));
        assert_eq!(miner.absorb_campaign(&raw).as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_absorb_garbage_is_skipped() {
        let mut miner = test_miner();
        assert!(miner.absorb_campaign(&json!({"id": 42})).is_none());
        assert!(miner.campaigns.is_empty());
    }

    #[test]
    fn test_campaigns_at_path_walk() {
        let data = json!({
            "currentUser": {"inventory": {"dropCampaignsInProgress": [1, 2, 3]}}
        });
        assert_eq!(
            campaigns_at(&data, &["currentUser", "inventory", "dropCampaignsInProgress"]).len(),
            3
        );
        assert!(campaigns_at(&data, &["currentUser", "missing"]).is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_gated_drop() {
        let mut miner = test_miner();
        let raw = wire_campaign_json(
            "c3",
            json!([
                {
                    "id": "d1",
                    "name": "First",
                    "requiredMinutesWatched": 10,
                    "self": {"currentMinutesWatched": 0, "isClaimed": false, "dropInstanceID": "i1"}
                },
                {
                    "id": "d2",
                    "name": "Second",
                    "requiredMinutesWatched": 10,
                    "preconditionDrops": [{"id": "d1"}],
                    "self": {"currentMinutesWatched": 10, "isClaimed": false, "dropInstanceID": "i2"}
                }
            ]),
        );
        miner.absorb_campaign(&raw);
        // d2 is complete but d1 is not claimed: no claim may happen.
        assert!(!miner.claim_drop("d2").await.unwrap());

        // Unknown drops are an invariant violation, not a silent no-op.
        assert!(miner.claim_drop("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_claim_skips_unlinked_campaign() {
        let mut miner = test_miner();
        let raw = wire_campaign_json(
            "c4",
            json!([{
                "id": "d9",
                "name": "Unlinked",
                "requiredMinutesWatched": 10,
                "self": {"currentMinutesWatched": 10, "isClaimed": false, "dropInstanceID": null}
            }]),
        );
        miner.absorb_campaign(&raw);
        // No instance id: surfaced on the console, no network call, no claim.
        assert!(!miner.claim_drop("d9").await.unwrap());
    }
}
