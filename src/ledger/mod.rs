//! The narrow view of the ledger that the coordination layer consumes.
use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{
    Address, Hash32, HostRecord, HostTaskBinding, RunningTask, TaskDescriptor, TaskId,
    TowerRecord,
};

pub mod memory;

pub use memory::InMemoryLedger;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown task descriptor `{0}`")]
    UnknownTask(Hash32),
    #[error("unknown host `{0}`")]
    UnknownHost(Address),
    #[error("unknown tower `{0}`")]
    UnknownTower(Address),
    #[error("unknown running task `{0}`")]
    UnknownRunningTask(TaskId),
    #[error("host `{host}` has no binding for task `{task}`")]
    NoBinding { host: Address, task: Hash32 },
    #[error("host `{host}` is not an accepted member of tower `{tower}`")]
    NotMember { host: Address, tower: Address },
    #[error("tower `{tower}` lacks capacity for `{size}` more bytes")]
    TowerFull { tower: Address, size: u64 },
    #[error("`{0}` is not allowed to do that")]
    NotAllowed(Address),
    #[error("output already registered for `{0}`")]
    OutputAlreadySet(TaskId),
    #[error("output not registered for `{0}`")]
    OutputMissing(TaskId),
    #[error("invalid commitment for `{0}`")]
    InvalidCommitment(TaskId),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// A tower's view for candidate matching: its record, the size of its active
/// tasks and the hosts it has accepted.
#[derive(Debug, Clone)]
pub struct TowerView {
    pub record: TowerRecord,
    pub used_size: u64,
    pub accepted_hosts: Vec<Address>,
}

/// A host's view for candidate matching.
#[derive(Debug, Clone)]
pub struct HostView {
    pub record: HostRecord,
    pub first_available_block: u64,
}

/// Everything the matcher reads, taken at one point of ledger state.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub task: TaskDescriptor,
    pub current_block: u64,
    pub scheduler_fee: u128,
    pub hosts: Vec<HostView>,
    // host bindings for `task`, keyed by host
    pub bindings: HashMap<Address, HostTaskBinding>,
    pub towers: Vec<TowerView>,
}

/// Read and write access to the ledger.
///
/// Reads report absence as `Ok(None)`; transport or availability problems
/// surface as `Err` and are never masked by callers.
#[async_trait]
pub trait LedgerOracle: Send + Sync {
    async fn current_block(&self) -> Result<u64, LedgerError>;

    async fn scheduler_fee(&self) -> Result<u128, LedgerError>;

    async fn get_task(&self, task_hash: &Hash32) -> Result<Option<TaskDescriptor>, LedgerError>;

    async fn get_host(&self, host: &Address) -> Result<Option<HostRecord>, LedgerError>;

    async fn get_tower(&self, tower: &Address) -> Result<Option<TowerRecord>, LedgerError>;

    async fn get_host_binding(
        &self,
        host: &Address,
        task_hash: &Hash32,
    ) -> Result<Option<HostTaskBinding>, LedgerError>;

    async fn get_host_first_available_block(&self, host: &Address) -> Result<u64, LedgerError>;

    async fn get_tower_used_size(&self, tower: &Address) -> Result<u64, LedgerError>;

    async fn get_tower_fee(
        &self,
        tower: &Address,
        size: u64,
        block_timeout: u64,
    ) -> Result<u128, LedgerError>;

    /// The running task, or `None` once it is cleared, finalized or expired.
    async fn get_running_task(&self, task_id: &TaskId) -> Result<Option<RunningTask>, LedgerError>;

    /// Consistent snapshot of the market for one task descriptor.
    async fn market_snapshot(&self, task_hash: &Hash32) -> Result<MarketSnapshot, LedgerError>;

    async fn submit_task(
        &self,
        owner: &Address,
        task_hash: &Hash32,
        host: &Address,
        tower: &Address,
        input_commitment: &Hash32,
    ) -> Result<TaskId, LedgerError>;

    async fn register_output(
        &self,
        host: &Address,
        task_id: &TaskId,
        output_commitment: &Hash32,
    ) -> Result<(), LedgerError>;

    async fn finalize_task(&self, owner: &Address, task_id: &TaskId) -> Result<(), LedgerError>;

    async fn report_wrong_input(&self, host: &Address, task_id: &TaskId) -> Result<(), LedgerError>;
}
