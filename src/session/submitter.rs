//! Submitter side: put a task on the ledger, ship its input through the
//! tower and collect the host's output.
use std::{sync::Arc, time::Duration};

use futures::{pin_mut, FutureExt};
use log::{info, warn};

use super::{poll_until_cleared, RelayClient, RelayFrame, SessionError};
use crate::{
    envelope,
    keys::{self, Identity},
    ledger::LedgerOracle,
    types::{Address, Candidate, Hash32, TaskId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The host's verified output arrived through the relay and the task was finalized.
    Completed { task_id: TaskId, output: Vec<u8> },
    /// The ledger cleared the task first, finalized or expired without a relayed reply.
    Cleared { task_id: TaskId },
}

pub struct Submitter {
    identity: Identity,
    ledger: Arc<dyn LedgerOracle>,
    poll_interval: Duration,
    relay_timeout: Duration,
}

impl Submitter {
    pub fn new(
        identity: Identity,
        ledger: Arc<dyn LedgerOracle>,
        poll_interval: Duration,
        relay_timeout: Duration,
    ) -> Self {
        Submitter {
            identity,
            ledger,
            poll_interval,
            relay_timeout,
        }
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Runs one task through `candidate` from submission to completion.
    #[tracing::instrument(skip(self, candidate, input), fields(owner = %self.identity.address(), host = %candidate.host, tower = %candidate.tower))]
    pub async fn run(
        &self,
        task_hash: &Hash32,
        candidate: &Candidate,
        input: &[u8],
    ) -> Result<Outcome, SessionError> {
        let host = self
            .ledger
            .get_host(&candidate.host)
            .await?
            .ok_or(SessionError::UnknownHost(candidate.host))?;
        let host_key = keys::public_key_from_encryption_key(&host.encryption_key)
            .map_err(|_| SessionError::InvalidHostKey(candidate.host))?;
        let tower = self
            .ledger
            .get_tower(&candidate.tower)
            .await?
            .ok_or(SessionError::UnknownTower(candidate.tower))?;

        let input_commitment = keys::commitment(input);
        let task_id = self
            .ledger
            .submit_task(
                &self.identity.address(),
                task_hash,
                &candidate.host,
                &candidate.tower,
                &input_commitment,
            )
            .await?;
        info!("Picked `{}` via `{}` for task `{task_id}`", candidate.host, candidate.tower);

        let mut client = RelayClient::connect(&tower.public_connection, self.identity.address()).await?;
        let frame = envelope::encode(&task_id, &host_key, input, &self.identity)?;
        client.send_envelope(frame).await?;

        let outcome = {
            let relayed = self.await_output(&mut client, &task_id, &candidate.host).fuse();
            let cleared = poll_until_cleared(self.ledger.as_ref(), &task_id, self.poll_interval).fuse();
            pin_mut!(relayed, cleared);
            futures::select! {
                output = relayed => {
                    let output = output?;
                    self.ledger.finalize_task(&self.identity.address(), &task_id).await?;
                    info!("Task `{task_id}` completed, `{}` output bytes", output.len());
                    Outcome::Completed { task_id, output }
                }
                done = cleared => {
                    done?;
                    warn!("Task `{task_id}` cleared on the ledger before a reply arrived");
                    Outcome::Cleared { task_id }
                }
            }
        };
        client.close().await;
        Ok(outcome)
    }

    // the host registers its output before replying, so the ledger already
    // holds the commitment the reply must match
    async fn await_output(
        &self,
        client: &mut RelayClient,
        task_id: &TaskId,
        host: &Address,
    ) -> Result<Vec<u8>, SessionError> {
        let frame = match tokio::time::timeout(self.relay_timeout, client.next_frame()).await {
            Ok(frame) => frame?,
            Err(_) => return Err(SessionError::Timeout(self.relay_timeout)),
        };
        let frame = match frame {
            Some(RelayFrame::Envelope(frame)) => frame,
            Some(RelayFrame::Fault(fault)) => return Err(SessionError::Relay(fault)),
            None => return Err(SessionError::Closed),
        };

        let opened = envelope::decode(&frame, host, self.identity.secret())?;
        if opened.task_id != *task_id {
            return Err(SessionError::UnexpectedTask {
                expected: *task_id,
                actual: opened.task_id,
            });
        }
        let running = self
            .ledger
            .get_running_task(task_id)
            .await?
            .ok_or(SessionError::TaskNotRunning(*task_id))?;
        envelope::verify_commitment(&opened.payload, &running.output_hash)?;
        Ok(opened.payload)
    }
}
