#![doc = include_str!("../README.md")]

use std::{
    cmp,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{
    Parser, Subcommand
};
use log::{info, warn};
use tokio::{
    net::TcpListener,
    sync::oneshot,
};
use tracing_subscriber::EnvFilter;

use meca_relay::{
    broker::{server, RelayBroker},
    config::Config,
    keys::{self, Identity},
    ledger::InMemoryLedger,
    matcher,
    session::{CommandExecutor, EchoExecutor, HostSession, Outcome, Submitter, TaskExecutor},
    types::{
        FeeType, Hash32, HostRecord, HostTaskBinding, TaskDescriptor, TowerRecord,
    },
};

// CLI
#[derive(Parser, Debug)]
#[command(name = "Relay CLI for MECA: off-chain coordination of a compute marketplace.")]
#[command(author = "MECA team")]
#[command(version = "0.1")]
#[command(about = "Runs a tower's relay broker, queries execution candidates \
                   and simulates a full task round trip.",
          long_about = None)
]
struct Cli {
    /// Config file, defaults to `~/.meca/config.toml`
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the relay broker over http and websockets
    Tower,

    /// Print the execution candidates of a task as json
    Candidates {
        /// The task descriptor hash
        #[arg(short, long)]
        task: Hash32,
    },

    /// Run one task end to end in a single process
    Simulate {
        /// The input file on disk
        #[arg(short, long)]
        input: PathBuf,

        /// Program (and its args) the host pipes the input through, echo if absent
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        exec: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .try_init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    info!("<-> Relay agent for MECA <->");

    match cli.command {
        Commands::Tower => run_tower(&config).await,

        Commands::Candidates { task } => {
            let ledger = load_ledger(&config)?;
            let candidates = matcher::candidates_for(&ledger, &task).await?;
            info!("Found `{}` candidates for task `{task}`", candidates.len());
            println!("{}", serde_json::to_string_pretty(&candidates)?);
            Ok(())
        },

        Commands::Simulate { input, exec } => simulate(&config, &input, exec).await,
    }
}

fn load_ledger(config: &Config) -> anyhow::Result<InMemoryLedger> {
    match &config.ledger.fixture {
        Some(fixture) => InMemoryLedger::from_fixture_file(Path::new(fixture)),
        None => {
            warn!("No ledger fixture configured, starting from an empty ledger.");
            Ok(InMemoryLedger::new())
        }
    }
}

async fn run_tower(config: &Config) -> anyhow::Result<()> {
    let tower = match config.tower.address {
        Some(address) => address,
        None => config
            .identity()?
            .ok_or_else(|| anyhow::Error::msg("Tower needs either `tower.address` or an identity"))?
            .address(),
    };
    let ledger = Arc::new(load_ledger(config)?);
    let producer = ledger.spawn_block_producer(config.block_time());
    let broker = Arc::new(RelayBroker::new(tower, ledger.clone(), config.forward_timeout()));

    let listener = TcpListener::bind(config.listen()).await?;
    server::serve(listener, broker, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down.");
    })
    .await?;
    producer.abort();
    Ok(())
}

async fn simulate(config: &Config, input_path: &Path, exec: Vec<String>) -> anyhow::Result<()> {
    let input = fs::read(input_path)?;
    let tower_id = Identity::random();
    let host_id = Identity::random();
    let owner_id = match config.identity()? {
        Some(identity) => identity,
        None => Identity::random(),
    };
    info!("Tower `{}`, host `{}`, submitter `{}`", tower_id.address(), host_id.address(), owner_id.address());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let tower_url = format!("http://{}", listener.local_addr()?);

    // a one-task market
    let ledger = Arc::new(InMemoryLedger::new());
    let task_hash = keys::keccak256(exec.join(" ").as_bytes());
    ledger.set_scheduler_fee(1);
    ledger.add_task(TaskDescriptor {
        hash: task_hash,
        owner: Identity::random().address(),
        fee: 10,
        computing_type: 0,
        size: input.len() as u64,
    });
    ledger.add_host(HostRecord {
        owner: host_id.address(),
        encryption_key: host_id.encryption_key(),
        block_timeout_limit: 100,
        stake: 0,
    });
    ledger.add_tower(TowerRecord {
        owner: tower_id.address(),
        public_connection: tower_url.clone(),
        size_limit: cmp::max(input.len() as u64, 1) * 4,
        fee: 3,
        fee_type: FeeType::Flat,
        stake: 0,
    });
    ledger.bind_host(host_id.address(), task_hash, HostTaskBinding { block_timeout: 50, fee: 5 });
    ledger.request_membership(tower_id.address(), host_id.address());
    ledger.accept_host(tower_id.address(), host_id.address());
    let producer = ledger.spawn_block_producer(config.block_time());

    let broker = Arc::new(RelayBroker::new(tower_id.address(), ledger.clone(), config.forward_timeout()));
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(listener, broker.clone(), async {
        let _ = server_stopped.await;
    }));

    let executor: Arc<dyn TaskExecutor> = match exec.split_first() {
        Some((program, args)) => Arc::new(CommandExecutor::new(program.clone(), args.to_vec())),
        None => Arc::new(EchoExecutor),
    };
    let host = HostSession::new(host_id, ledger.clone(), executor);
    let host_address = host.address();
    let (stop_host, host_stopped) = oneshot::channel::<()>();
    let host_url = tower_url.clone();
    let host_session = tokio::spawn(async move {
        host.run_until(&host_url, async {
            let _ = host_stopped.await;
        })
        .await
    });

    let mut waited = Duration::ZERO;
    while false == broker.is_connected(&host_address) {
        if waited >= Duration::from_secs(5) {
            anyhow::bail!("Host did not connect to the tower in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    // cheapest first, ranking is up to the caller
    let candidate = matcher::candidates_for(ledger.as_ref(), &task_hash)
        .await?
        .into_iter()
        .min_by_key(|c| c.fee.total())
        .ok_or_else(|| anyhow::Error::msg("No candidate can run the task"))?;
    info!("Candidate fee breakdown: `{:?}`", candidate.fee);

    let submitter = Submitter::new(owner_id, ledger.clone(), config.poll_interval(), config.relay_timeout());
    let outcome = submitter.run(&task_hash, &candidate, &input).await;

    let _ = stop_host.send(());
    if let Ok(Err(e)) = host_session.await {
        warn!("Host session ended with: `{e}`");
    }
    let _ = stop_server.send(());
    server.await??;
    producer.abort();

    match outcome? {
        Outcome::Completed { task_id, output } => {
            info!("Task `{task_id}` is complete.");
            std::io::stdout().write_all(&output)?;
        },
        Outcome::Cleared { task_id } => {
            warn!("Task `{task_id}` left the ledger without a relayed result.");
        },
    }
    Ok(())
}
