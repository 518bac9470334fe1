//! In-memory ledger, seeded from code or from a TOML fixture.
use std::{
    cmp,
    collections::HashMap,
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;

use super::{HostView, LedgerError, LedgerOracle, MarketSnapshot, TowerView};
use crate::{
    keys,
    types::{
        Address, EncryptionKey, FeeBreakdown, FeeType, Hash32, HostRecord, HostTaskBinding,
        RunningTask, TaskDescriptor, TaskId, TowerRecord,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Pending,
    Accepted,
}

#[derive(Debug, Default)]
struct State {
    block: u64,
    scheduler_fee: u128,
    tasks: HashMap<Hash32, TaskDescriptor>,
    hosts: HashMap<Address, HostRecord>,
    towers: HashMap<Address, TowerRecord>,
    bindings: HashMap<(Address, Hash32), HostTaskBinding>,
    first_available: HashMap<Address, u64>,
    // (tower, host)
    memberships: HashMap<(Address, Address), Membership>,
    running: HashMap<TaskId, RunningTask>,
    nonce: u64,
}

impl State {
    fn is_active(&self, task: &RunningTask) -> bool {
        !task.is_cleared() && self.block <= task.deadline()
    }

    fn active(&self, task_id: &TaskId) -> Option<&RunningTask> {
        self.running.get(task_id).filter(|t| self.is_active(t))
    }

    fn prune_expired(&mut self) -> usize {
        let before = self.running.len();
        let block = self.block;
        self.running.retain(|_, t| block <= t.deadline());
        before - self.running.len()
    }

    fn used_size(&self, tower: &Address) -> u64 {
        self.running
            .values()
            .filter(|t| t.tower == *tower && self.is_active(t))
            .fold(0u64, |acc, t| acc.saturating_add(t.size))
    }

    fn accepted_hosts(&self, tower: &Address) -> Vec<Address> {
        let mut hosts: Vec<Address> = self
            .memberships
            .iter()
            .filter(|((t, _), m)| t == tower && **m == Membership::Accepted)
            .map(|((_, h), _)| *h)
            .collect();
        hosts.sort();
        hosts
    }
}

/// A ledger kept entirely in memory, following the contract rules closely
/// enough to drive the relay end to end.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self) -> u64 {
        self.state.read().block
    }

    pub fn set_block(&self, block: u64) {
        self.state.write().block = block;
    }

    pub fn advance_blocks(&self, n: u64) -> u64 {
        let mut state = self.state.write();
        state.block = state.block.saturating_add(n);
        let expired = state.prune_expired();
        debug!("Ledger at block `{}`, `{expired}` tasks expired", state.block);
        state.block
    }

    pub fn set_scheduler_fee(&self, fee: u128) {
        self.state.write().scheduler_fee = fee;
    }

    pub fn add_task(&self, task: TaskDescriptor) {
        self.state.write().tasks.insert(task.hash, task);
    }

    pub fn add_host(&self, host: HostRecord) {
        self.state.write().hosts.insert(host.owner, host);
    }

    pub fn add_tower(&self, tower: TowerRecord) {
        self.state.write().towers.insert(tower.owner, tower);
    }

    pub fn bind_host(&self, host: Address, task_hash: Hash32, binding: HostTaskBinding) {
        self.state.write().bindings.insert((host, task_hash), binding);
    }

    pub fn set_first_available_block(&self, host: Address, block: u64) {
        self.state.write().first_available.insert(host, block);
    }

    pub fn request_membership(&self, tower: Address, host: Address) {
        self.state
            .write()
            .memberships
            .entry((tower, host))
            .or_insert(Membership::Pending);
    }

    /// Accepts a pending membership request; returns false if there was none.
    pub fn accept_host(&self, tower: Address, host: Address) -> bool {
        match self.state.write().memberships.get_mut(&(tower, host)) {
            Some(m) => {
                *m = Membership::Accepted;
                true
            }
            None => false,
        }
    }

    pub fn reject_host(&self, tower: Address, host: Address) -> bool {
        self.state
            .write()
            .memberships
            .remove(&(tower, host))
            .is_some()
    }

    pub fn insert_running_task(&self, task_id: TaskId, task: RunningTask) {
        self.state.write().running.insert(task_id, task);
    }

    /// Drives block height forward at a fixed pace until the handle is aborted.
    pub fn spawn_block_producer(self: &Arc<Self>, block_time: Duration) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(block_time));
            // first tick fires immediately
            ticks.next().await;
            while ticks.next().await.is_some() {
                ledger.advance_blocks(1);
            }
        })
    }

    pub fn from_fixture_file(path: &Path) -> anyhow::Result<Self> {
        let fixture: Fixture = toml::from_str(&fs::read_to_string(path)?)?;
        let ledger = InMemoryLedger::new();
        ledger.load(fixture)?;
        info!("Ledger fixture `{}` loaded", path.display());
        Ok(ledger)
    }

    fn load(&self, fixture: Fixture) -> anyhow::Result<()> {
        let mut state = self.state.write();
        state.block = fixture.current_block;
        state.scheduler_fee = fixture.scheduler_fee.into();
        for t in fixture.tasks {
            state.tasks.insert(
                t.hash,
                TaskDescriptor {
                    hash: t.hash,
                    owner: t.owner,
                    fee: t.fee.into(),
                    computing_type: t.computing_type,
                    size: t.size,
                },
            );
        }
        for h in fixture.hosts {
            state.first_available.insert(h.owner, h.first_available_block);
            state.hosts.insert(
                h.owner,
                HostRecord {
                    owner: h.owner,
                    encryption_key: h.encryption_key,
                    block_timeout_limit: h.block_timeout_limit,
                    stake: h.stake.into(),
                },
            );
        }
        for t in fixture.towers {
            state.towers.insert(
                t.owner,
                TowerRecord {
                    owner: t.owner,
                    public_connection: t.public_connection,
                    size_limit: t.size_limit,
                    fee: t.fee.into(),
                    fee_type: t.fee_type,
                    stake: t.stake.into(),
                },
            );
        }
        for b in fixture.bindings {
            if false == state.hosts.contains_key(&b.host) {
                anyhow::bail!("binding for unknown host `{}`", b.host);
            }
            state.bindings.insert(
                (b.host, b.task),
                HostTaskBinding {
                    block_timeout: b.block_timeout,
                    fee: b.fee.into(),
                },
            );
        }
        for m in fixture.memberships {
            if false == state.towers.contains_key(&m.tower) {
                anyhow::bail!("membership for unknown tower `{}`", m.tower);
            }
            state.memberships.insert((m.tower, m.host), m.status);
        }
        for r in fixture.running {
            let fee = FeeBreakdown::new(r.fee.task.into(), r.fee.tower.into(), r.fee.host.into(), r.fee.scheduler.into())
                .ok_or(LedgerError::Overflow)?;
            state.running.insert(
                r.id,
                RunningTask {
                    task_hash: r.task_hash,
                    input_hash: r.input_hash,
                    output_hash: r.output_hash.unwrap_or(Hash32::ZERO),
                    size: r.size,
                    tower: r.tower,
                    host: r.host,
                    owner: r.owner,
                    start_block: r.start_block,
                    block_timeout: r.block_timeout,
                    fee,
                },
            );
        }
        Ok(())
    }
}

// fixture amounts are u64, TOML integers do not reach u128
#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    current_block: u64,
    #[serde(default)]
    scheduler_fee: u64,
    #[serde(default)]
    tasks: Vec<FixtureTask>,
    #[serde(default)]
    hosts: Vec<FixtureHost>,
    #[serde(default)]
    towers: Vec<FixtureTower>,
    #[serde(default)]
    bindings: Vec<FixtureBinding>,
    #[serde(default)]
    memberships: Vec<FixtureMembership>,
    #[serde(default)]
    running: Vec<FixtureRunning>,
}

#[derive(Debug, Deserialize)]
struct FixtureTask {
    hash: Hash32,
    owner: Address,
    fee: u64,
    #[serde(default)]
    computing_type: u8,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct FixtureHost {
    owner: Address,
    encryption_key: EncryptionKey,
    block_timeout_limit: u64,
    #[serde(default)]
    stake: u64,
    #[serde(default)]
    first_available_block: u64,
}

#[derive(Debug, Deserialize)]
struct FixtureTower {
    owner: Address,
    public_connection: String,
    size_limit: u64,
    fee: u64,
    fee_type: FeeType,
    #[serde(default)]
    stake: u64,
}

#[derive(Debug, Deserialize)]
struct FixtureBinding {
    host: Address,
    task: Hash32,
    block_timeout: u64,
    fee: u64,
}

#[derive(Debug, Deserialize)]
struct FixtureMembership {
    tower: Address,
    host: Address,
    status: Membership,
}

#[derive(Debug, Default, Deserialize)]
struct FixtureFee {
    #[serde(default)]
    task: u64,
    #[serde(default)]
    tower: u64,
    #[serde(default)]
    host: u64,
    #[serde(default)]
    scheduler: u64,
}

#[derive(Debug, Deserialize)]
struct FixtureRunning {
    id: TaskId,
    task_hash: Hash32,
    input_hash: Hash32,
    output_hash: Option<Hash32>,
    size: u64,
    tower: Address,
    host: Address,
    owner: Address,
    start_block: u64,
    block_timeout: u64,
    #[serde(default)]
    fee: FixtureFee,
}

#[async_trait]
impl LedgerOracle for InMemoryLedger {
    async fn current_block(&self) -> Result<u64, LedgerError> {
        Ok(self.state.read().block)
    }

    async fn scheduler_fee(&self) -> Result<u128, LedgerError> {
        Ok(self.state.read().scheduler_fee)
    }

    async fn get_task(&self, task_hash: &Hash32) -> Result<Option<TaskDescriptor>, LedgerError> {
        Ok(self.state.read().tasks.get(task_hash).cloned())
    }

    async fn get_host(&self, host: &Address) -> Result<Option<HostRecord>, LedgerError> {
        Ok(self.state.read().hosts.get(host).cloned())
    }

    async fn get_tower(&self, tower: &Address) -> Result<Option<TowerRecord>, LedgerError> {
        Ok(self.state.read().towers.get(tower).cloned())
    }

    async fn get_host_binding(
        &self,
        host: &Address,
        task_hash: &Hash32,
    ) -> Result<Option<HostTaskBinding>, LedgerError> {
        Ok(self.state.read().bindings.get(&(*host, *task_hash)).copied())
    }

    async fn get_host_first_available_block(&self, host: &Address) -> Result<u64, LedgerError> {
        let state = self.state.read();
        if false == state.hosts.contains_key(host) {
            return Err(LedgerError::UnknownHost(*host));
        }
        Ok(state.first_available.get(host).copied().unwrap_or(0))
    }

    async fn get_tower_used_size(&self, tower: &Address) -> Result<u64, LedgerError> {
        let state = self.state.read();
        if false == state.towers.contains_key(tower) {
            return Err(LedgerError::UnknownTower(*tower));
        }
        Ok(state.used_size(tower))
    }

    async fn get_tower_fee(
        &self,
        tower: &Address,
        size: u64,
        block_timeout: u64,
    ) -> Result<u128, LedgerError> {
        self.state
            .read()
            .towers
            .get(tower)
            .map(|t| t.fee_for(size, block_timeout))
            .ok_or(LedgerError::UnknownTower(*tower))
    }

    async fn get_running_task(&self, task_id: &TaskId) -> Result<Option<RunningTask>, LedgerError> {
        Ok(self.state.read().active(task_id).cloned())
    }

    async fn market_snapshot(&self, task_hash: &Hash32) -> Result<MarketSnapshot, LedgerError> {
        let state = self.state.read();
        let task = state
            .tasks
            .get(task_hash)
            .cloned()
            .ok_or(LedgerError::UnknownTask(*task_hash))?;
        let mut hosts: Vec<HostView> = state
            .hosts
            .values()
            .map(|record| HostView {
                record: record.clone(),
                first_available_block: state.first_available.get(&record.owner).copied().unwrap_or(0),
            })
            .collect();
        hosts.sort_by_key(|h| h.record.owner);
        let bindings = state
            .bindings
            .iter()
            .filter(|((_, task), _)| task == task_hash)
            .map(|((host, _), binding)| (*host, *binding))
            .collect();
        let mut towers: Vec<TowerView> = state
            .towers
            .values()
            .map(|record| TowerView {
                record: record.clone(),
                used_size: state.used_size(&record.owner),
                accepted_hosts: state.accepted_hosts(&record.owner),
            })
            .collect();
        towers.sort_by_key(|t| t.record.owner);
        Ok(MarketSnapshot {
            task,
            current_block: state.block,
            scheduler_fee: state.scheduler_fee,
            hosts,
            bindings,
            towers,
        })
    }

    async fn submit_task(
        &self,
        owner: &Address,
        task_hash: &Hash32,
        host: &Address,
        tower: &Address,
        input_commitment: &Hash32,
    ) -> Result<TaskId, LedgerError> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get(task_hash)
            .cloned()
            .ok_or(LedgerError::UnknownTask(*task_hash))?;
        if false == state.hosts.contains_key(host) {
            return Err(LedgerError::UnknownHost(*host));
        }
        let tower_record = state
            .towers
            .get(tower)
            .cloned()
            .ok_or(LedgerError::UnknownTower(*tower))?;
        let binding = state
            .bindings
            .get(&(*host, *task_hash))
            .copied()
            .filter(|b| b.block_timeout > 0)
            .ok_or(LedgerError::NoBinding {
                host: *host,
                task: *task_hash,
            })?;
        if state.memberships.get(&(*tower, *host)) != Some(&Membership::Accepted) {
            return Err(LedgerError::NotMember {
                host: *host,
                tower: *tower,
            });
        }
        let used = state.used_size(tower);
        match used.checked_add(task.size) {
            Some(total) if total <= tower_record.size_limit => {}
            _ => {
                return Err(LedgerError::TowerFull {
                    tower: *tower,
                    size: task.size,
                })
            }
        }

        let fee = FeeBreakdown::new(
            task.fee,
            tower_record.fee_for(task.size, binding.block_timeout),
            binding.fee,
            state.scheduler_fee,
        )
        .ok_or(LedgerError::Overflow)?;
        let queue_end = state.first_available.get(host).copied().unwrap_or(0);
        let start_block = cmp::max(state.block, queue_end);
        let next_available = start_block
            .checked_add(binding.block_timeout)
            .ok_or(LedgerError::Overflow)?;

        state.nonce += 1;
        let mut preimage = Vec::with_capacity(20 * 3 + 32 * 2 + 8);
        preimage.extend_from_slice(owner.as_bytes());
        preimage.extend_from_slice(task_hash.as_bytes());
        preimage.extend_from_slice(host.as_bytes());
        preimage.extend_from_slice(tower.as_bytes());
        preimage.extend_from_slice(input_commitment.as_bytes());
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let task_id = keys::keccak256(&preimage);

        state.first_available.insert(*host, next_available);
        state.running.insert(
            task_id,
            RunningTask {
                task_hash: *task_hash,
                input_hash: *input_commitment,
                output_hash: Hash32::ZERO,
                size: task.size,
                tower: *tower,
                host: *host,
                owner: *owner,
                start_block,
                block_timeout: binding.block_timeout,
                fee,
            },
        );
        info!(
            "Task `{task_id}` submitted by `{owner}` to host `{host}` via tower `{tower}`, starts at block `{start_block}`"
        );
        Ok(task_id)
    }

    async fn register_output(
        &self,
        host: &Address,
        task_id: &TaskId,
        output_commitment: &Hash32,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        let running = state
            .active(task_id)
            .cloned()
            .ok_or(LedgerError::UnknownRunningTask(*task_id))?;
        if running.host != *host {
            return Err(LedgerError::NotAllowed(*host));
        }
        if output_commitment.is_zero() {
            return Err(LedgerError::InvalidCommitment(*task_id));
        }
        if false == running.output_hash.is_zero() {
            return Err(LedgerError::OutputAlreadySet(*task_id));
        }
        if let Some(task) = state.running.get_mut(task_id) {
            task.output_hash = *output_commitment;
        }
        info!("Output `{output_commitment}` registered for task `{task_id}`");
        Ok(())
    }

    async fn finalize_task(&self, owner: &Address, task_id: &TaskId) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        let running = state
            .active(task_id)
            .ok_or(LedgerError::UnknownRunningTask(*task_id))?;
        if running.owner != *owner {
            return Err(LedgerError::NotAllowed(*owner));
        }
        if running.output_hash.is_zero() {
            return Err(LedgerError::OutputMissing(*task_id));
        }
        state.running.remove(task_id);
        info!("Task `{task_id}` finalized");
        Ok(())
    }

    async fn report_wrong_input(&self, host: &Address, task_id: &TaskId) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        let running = state
            .active(task_id)
            .ok_or(LedgerError::UnknownRunningTask(*task_id))?;
        if running.host != *host {
            return Err(LedgerError::NotAllowed(*host));
        }
        state.running.remove(task_id);
        warn!("Task `{task_id}` invalidated, host `{host}` reported a wrong input hash");
        Ok(())
    }
}
