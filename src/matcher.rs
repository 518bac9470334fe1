//! Which (tower, host) pairs can execute a task, and at what price.
use std::collections::HashMap;

use log::{debug, warn};

use crate::{
    ledger::{HostView, LedgerError, LedgerOracle, MarketSnapshot, TowerView},
    types::{Address, Candidate, FeeBreakdown, Hash32, HostTaskBinding, TaskDescriptor},
};

/// Returns every feasible pairing, unranked.
///
/// A host qualifies when it has a binding for the task and its queue lets it
/// finish within its own timeout limit counted from `current_block`. A tower
/// qualifies when the task fits its remaining capacity. Pairs are kept only
/// where the host is an accepted member of the tower.
pub fn match_candidates(
    task: &TaskDescriptor,
    hosts: &[HostView],
    bindings: &HashMap<Address, HostTaskBinding>,
    towers: &[TowerView],
    current_block: u64,
    scheduler_fee: u128,
) -> Vec<Candidate> {
    let eligible_hosts: Vec<(&HostView, HostTaskBinding, u64)> = hosts
        .iter()
        .filter_map(|host| {
            let binding = bindings.get(&host.record.owner).filter(|b| b.block_timeout > 0)?;
            let projected = host.first_available_block.checked_add(binding.block_timeout)?;
            let window = current_block.saturating_add(host.record.block_timeout_limit);
            if projected > window {
                debug!(
                    "Host `{}` projects block `{projected}`, past its window `{window}`",
                    host.record.owner
                );
                return None;
            }
            Some((host, *binding, projected))
        })
        .collect();

    let eligible_towers = towers.iter().filter(|tower| {
        tower
            .used_size
            .checked_add(task.size)
            .is_some_and(|total| total <= tower.record.size_limit)
    });

    let mut candidates = Vec::new();
    for tower in eligible_towers {
        for (host, binding, end_block) in eligible_hosts.iter() {
            if false == tower.accepted_hosts.contains(&host.record.owner) {
                continue;
            }
            let tower_fee = tower.record.fee_for(task.size, binding.block_timeout);
            let Some(fee) = FeeBreakdown::new(task.fee, tower_fee, binding.fee, scheduler_fee) else {
                warn!(
                    "Fees overflow for tower `{}` and host `{}`, pair skipped",
                    tower.record.owner, host.record.owner
                );
                continue;
            };
            candidates.push(Candidate {
                tower: tower.record.owner,
                host: host.record.owner,
                end_block: *end_block,
                fee,
            });
        }
    }
    candidates
}

impl MarketSnapshot {
    pub fn candidates(&self) -> Vec<Candidate> {
        match_candidates(
            &self.task,
            &self.hosts,
            &self.bindings,
            &self.towers,
            self.current_block,
            self.scheduler_fee,
        )
    }
}

/// Matches against a single consistent snapshot read from the ledger.
pub async fn candidates_for(
    ledger: &dyn LedgerOracle,
    task_hash: &Hash32,
) -> Result<Vec<Candidate>, LedgerError> {
    let snapshot = ledger.market_snapshot(task_hash).await?;
    Ok(snapshot.candidates())
}
