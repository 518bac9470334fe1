//! Host side: answer relayed task inputs with verified, registered outputs.
use std::{future::Future, process::Stdio, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use futures::{pin_mut, FutureExt};
use log::{info, warn};
use tokio::{io::AsyncWriteExt, process::Command};

use super::{RelayClient, RelayFrame, SessionError};
use crate::{
    envelope,
    keys::{self, Identity},
    ledger::LedgerOracle,
    types::{Address, Hash32},
};

/// Runs a task on a verified input.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task_hash: &Hash32, input: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// Returns the input unchanged.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, _task_hash: &Hash32, input: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(input)
    }
}

/// Pipes the input through an external program, stdin to stdout.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandExecutor {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task_hash: &Hash32, input: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("MECA_TASK_HASH", task_hash.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.program))?;
        // stdout is drained while stdin is written, filters block otherwise
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            // dropping stdin lets the program see end of input
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if false == output.status.success() {
            anyhow::bail!("`{}` exited with `{}`", self.program, output.status);
        }
        match fed {
            // the program finished without reading all of its input
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            other => other?,
        }
        Ok(output.stdout)
    }
}

pub struct HostSession {
    identity: Identity,
    ledger: Arc<dyn LedgerOracle>,
    executor: Arc<dyn TaskExecutor>,
}

impl HostSession {
    pub fn new(identity: Identity, ledger: Arc<dyn LedgerOracle>, executor: Arc<dyn TaskExecutor>) -> Self {
        HostSession {
            identity,
            ledger,
            executor,
        }
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Serves relayed requests until `shutdown` resolves or the tower hangs up.
    /// A request that fails is rejected back through the tower; the session
    /// keeps going.
    #[tracing::instrument(skip(self, shutdown), fields(host = %self.identity.address()))]
    pub async fn run_until<F>(&self, tower_url: &str, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let mut client = RelayClient::connect(tower_url, self.identity.address()).await?;
        info!("Host `{}` serving through `{tower_url}`", self.identity.address());
        let shutdown = shutdown.fuse();
        pin_mut!(shutdown);

        loop {
            let frame = futures::select! {
                frame = client.next_frame().fuse() => frame?,
                _ = shutdown => break,
            };
            match frame {
                Some(RelayFrame::Envelope(frame)) => match self.handle(&frame).await {
                    Ok(reply) => client.send_envelope(reply).await?,
                    Err(e) => {
                        warn!("Request rejected: {e}");
                        client.send_fault(&e.to_fault()).await?;
                    }
                },
                Some(RelayFrame::Fault(fault)) => {
                    warn!("Tower reported {:?}: {}", fault.kind, fault.message);
                }
                None => return Err(SessionError::Closed),
            }
        }
        client.close().await;
        Ok(())
    }

    /// Verifies, executes and answers one relayed input.
    pub async fn handle(&self, frame: &[u8]) -> Result<Vec<u8>, SessionError> {
        let me = self.identity.address();
        let task_id = envelope::task_id_of(frame)?;
        let running = self
            .ledger
            .get_running_task(&task_id)
            .await?
            .ok_or(SessionError::TaskNotRunning(task_id))?;
        if running.host != me {
            return Err(SessionError::NotAssigned {
                task_id,
                host: running.host,
            });
        }

        let opened = envelope::decode(frame, &running.owner, self.identity.secret())?;
        if let Err(e) = envelope::verify_commitment(&opened.payload, &running.input_hash) {
            warn!("Task `{task_id}` input does not match its commitment, reporting");
            self.ledger.report_wrong_input(&me, &task_id).await?;
            return Err(e.into());
        }

        let output = self
            .executor
            .execute(&running.task_hash, opened.payload)
            .await
            .map_err(|e| SessionError::Execution(format!("{e:#}")))?;
        self.ledger
            .register_output(&me, &task_id, &keys::commitment(&output))
            .await?;
        info!("Task `{task_id}` executed, `{}` output bytes", output.len());

        // replies go to the key that signed the request
        Ok(envelope::encode(&task_id, &opened.signer, &output, &self.identity)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{InMemoryLedger, LedgerError},
        types::{FeeBreakdown, RunningTask},
    };

    struct Upper;

    #[async_trait]
    impl TaskExecutor for Upper {
        async fn execute(&self, _: &Hash32, input: Vec<u8>) -> anyhow::Result<Vec<u8>> {
            Ok(input.to_ascii_uppercase())
        }
    }

    fn setup(input: &[u8]) -> (Arc<InMemoryLedger>, Identity, Identity, Hash32) {
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = Identity::random();
        let host = Identity::random();
        let task_id = Hash32([0x11; 32]);
        ledger.insert_running_task(
            task_id,
            RunningTask {
                task_hash: Hash32([0xaa; 32]),
                input_hash: keys::commitment(input),
                output_hash: Hash32::ZERO,
                size: 1,
                tower: Address([7u8; 20]),
                host: host.address(),
                owner: owner.address(),
                start_block: 0,
                block_timeout: 10,
                fee: FeeBreakdown::default(),
            },
        );
        (ledger, owner, host, task_id)
    }

    #[tokio::test]
    async fn test_handle_executes_and_registers() {
        let (ledger, owner, host, task_id) = setup(b"hello");
        let session = HostSession::new(host.clone(), ledger.clone(), Arc::new(Upper));
        let request = envelope::encode(&task_id, &host.public_key(), b"hello", &owner).unwrap();

        let reply = session.handle(&request).await.unwrap();
        let opened = envelope::decode(&reply, &host.address(), owner.secret()).unwrap();
        assert_eq!(opened.payload, b"HELLO");
        let running = ledger.get_running_task(&task_id).await.unwrap().unwrap();
        assert_eq!(running.output_hash, keys::commitment(b"HELLO"));
    }

    #[tokio::test]
    async fn test_wrong_input_is_reported() {
        let (ledger, owner, host, task_id) = setup(b"hello");
        let session = HostSession::new(host.clone(), ledger.clone(), Arc::new(EchoExecutor));
        let request = envelope::encode(&task_id, &host.public_key(), b"HELLO", &owner).unwrap();

        let err = session.handle(&request).await.unwrap_err();
        assert!(matches!(err, SessionError::Commitment(_)));
        assert!(ledger.get_running_task(&task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_signer_rejected() {
        let (ledger, _, host, task_id) = setup(b"hello");
        let session = HostSession::new(host.clone(), ledger.clone(), Arc::new(EchoExecutor));
        let mallory = Identity::random();
        let request = envelope::encode(&task_id, &host.public_key(), b"hello", &mallory).unwrap();

        let err = session.handle(&request).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Envelope(envelope::EnvelopeError::CounterpartyMismatch { .. })
        ));
        // the record is untouched
        assert!(ledger.get_running_task(&task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_not_this_host() {
        let (ledger, owner, host, task_id) = setup(b"hello");
        let other = HostSession::new(Identity::random(), ledger.clone(), Arc::new(EchoExecutor));
        let request = envelope::encode(&task_id, &host.public_key(), b"hello", &owner).unwrap();
        assert!(matches!(
            other.handle(&request).await,
            Err(SessionError::NotAssigned { .. })
        ));
        let unknown = envelope::encode(&Hash32([0x99; 32]), &host.public_key(), b"hello", &owner).unwrap();
        assert!(matches!(
            other.handle(&unknown).await,
            Err(SessionError::TaskNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_output_registered_once() {
        let (ledger, owner, host, task_id) = setup(b"hello");
        let session = HostSession::new(host.clone(), ledger.clone(), Arc::new(EchoExecutor));
        let request = envelope::encode(&task_id, &host.public_key(), b"hello", &owner).unwrap();
        session.handle(&request).await.unwrap();
        assert!(matches!(
            session.handle(&request).await,
            Err(SessionError::Ledger(LedgerError::OutputAlreadySet(_)))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor() {
        let cat = CommandExecutor::new("cat", vec![]);
        assert_eq!(cat.execute(&Hash32::ZERO, b"piped".to_vec()).await.unwrap(), b"piped");
        let failing = CommandExecutor::new("false", vec![]);
        assert!(failing.execute(&Hash32::ZERO, vec![]).await.is_err());
        let missing = CommandExecutor::new("/nonexistent/program", vec![]);
        assert!(missing.execute(&Hash32::ZERO, vec![]).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_large_input() {
        let cat = CommandExecutor::new("cat", vec![]);
        let input: Vec<u8> = (0..(1usize << 20)).map(|i| i as u8).collect();
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            cat.execute(&Hash32::ZERO, input.clone()),
        )
        .await
        .expect("cat stalled on a large input")
        .unwrap();
        assert_eq!(output, input);
    }
}
