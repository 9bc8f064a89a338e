//! In-process swarm simulation
//!
//! Starts several nodes on one rendezvous and one in-memory network, runs a
//! scenario end-to-end and prints what every node converged to.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use meshfeed_core::core_credentials::Role;
use meshfeed_core::core_feed::MemoryStorage;
use meshfeed_core::core_replication::{MemoryReconciler, SpaceHandle, SpaceSnapshot};
use meshfeed_core::core_signal::MemoryRendezvous;
use meshfeed_core::core_transport::MemoryNetwork;
use meshfeed_core::logging::{init_logging, LogConfig};
use meshfeed_core::{metrics, Keypair, MeshConfig, MeshError, Node, PublicKey};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshfeed-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file; MESHFEED_* variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give up waiting for convergence after this many seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Admit every peer, let each write, and wait until all agree
    Converge {
        #[arg(short, long, default_value = "3")]
        peers: usize,

        /// Data entries written by each peer
        #[arg(short, long, default_value = "5")]
        messages: usize,

        /// Print the founder's final snapshot as JSON
        #[arg(long)]
        dump: bool,
    },
    /// Admit a member, let it write, revoke it and show its next write fail
    Revoke,
}

struct SimNode {
    name: String,
    node: Node,
    reconciler: Arc<MemoryReconciler>,
}

struct Sim {
    config: MeshConfig,
    rendezvous: MemoryRendezvous,
    network: MemoryNetwork,
    deadline: Duration,
}

impl Sim {
    fn node(&self, name: String) -> SimNode {
        let identity = Keypair::generate();
        let reconciler = Arc::new(MemoryReconciler::new());
        let node = Node::new(
            self.config.clone(),
            identity.clone(),
            Arc::new(self.rendezvous.clone()),
            self.network.factory(identity.public_key()),
            Arc::new(MemoryStorage::new()),
            reconciler.clone(),
        );
        SimNode {
            name,
            node,
            reconciler,
        }
    }

    async fn wait_for<P>(&self, handle: &SpaceHandle, what: &str, pred: P) -> Result<Arc<SpaceSnapshot>>
    where
        P: Fn(&SpaceSnapshot) -> bool,
    {
        let mut watch = handle.watch();
        let wait = async {
            loop {
                {
                    let snapshot = watch.borrow_and_update().clone();
                    if pred(&snapshot) {
                        return Ok::<_, anyhow::Error>(snapshot);
                    }
                }
                watch
                    .changed()
                    .await
                    .map_err(|_| anyhow!("space engine stopped"))?;
            }
        };
        tokio::time::timeout(self.deadline, wait)
            .await
            .with_context(|| format!("timed out waiting for {}", what))?
    }

    /// Admit `member` and wait until it can write.
    async fn join(&self, founder: &SimNode, member: &SimNode, space: PublicKey, role: Role) -> Result<()> {
        let identity = member.node.identity();
        founder.node.admit_member(space, identity, role).await?;
        member.node.open_space(space).await?;
        let handle = member.node.space(space).await?;
        self.wait_for(&handle, "admission", |s| s.membership.role_of(&identity) == Some(role))
            .await?;
        member.node.admit_own_feed(space).await?;
        info!(node = %member.name, role = %role, "Joined space");
        Ok(())
    }

    async fn converge(&self, peers: usize, messages: usize, dump: bool) -> Result<()> {
        if peers == 0 {
            bail!("need at least one peer");
        }
        let nodes: Vec<SimNode> = (0..peers).map(|i| self.node(format!("peer-{}", i))).collect();
        let founder = &nodes[0];
        let space = founder.node.create_space().await?;
        info!(space = %space.short(), "Space created");

        for member in &nodes[1..] {
            self.join(founder, member, space, Role::Member).await?;
        }
        for node in &nodes {
            for i in 0..messages {
                let payload = format!("{} message {}", node.name, i);
                node.node.write(space, payload.into_bytes()).await?;
            }
        }

        let expected = (peers * messages) as u64;
        let mut snapshots = Vec::with_capacity(peers);
        for node in &nodes {
            let handle = node.node.space(space).await?;
            let snapshot = self
                .wait_for(&handle, "convergence", |s| s.applied == expected && s.pending == 0)
                .await?;
            snapshots.push(snapshot);
        }

        println!("space {}", space);
        for (node, snapshot) in nodes.iter().zip(&snapshots) {
            println!(
                "  {:<8} {}  feeds={} members={} applied={} reconciled={}",
                node.name,
                node.node.identity().short(),
                snapshot.processed.len(),
                snapshot.membership.members.len(),
                snapshot.applied,
                node.reconciler.len(),
            );
        }
        let reference = &snapshots[0];
        let converged = snapshots
            .iter()
            .all(|s| s.processed == reference.processed && s.membership == reference.membership);
        println!("converged: {}", converged);
        if dump {
            println!("{}", serde_json::to_string_pretty(reference.as_ref())?);
        }

        for node in &nodes {
            node.node.shutdown().await;
        }
        if !converged {
            bail!("peers disagree after replication");
        }
        Ok(())
    }

    async fn revoke(&self) -> Result<()> {
        let owner = self.node("owner".to_string());
        let member = self.node("member".to_string());
        let space = owner.node.create_space().await?;
        self.join(&owner, &member, space, Role::Member).await?;

        member.node.write(space, b"before revocation".to_vec()).await?;
        let owner_space = owner.node.space(space).await?;
        self.wait_for(&owner_space, "member data", |s| s.applied == 1).await?;

        let identity = member.node.identity();
        owner.node.update_member(space, identity, Role::Removed).await?;
        let member_space = member.node.space(space).await?;
        self.wait_for(&member_space, "revocation", |s| {
            s.membership.role_of(&identity) == Some(Role::Removed)
        })
        .await?;

        match member.node.write(space, b"after revocation".to_vec()).await {
            Ok(position) => bail!("revoked member wrote at seq {}", position.seq),
            Err(err) => {
                let err = MeshError::from(err);
                println!("write after revocation refused: {} ({:?})", err, err.class());
            }
        }
        println!(
            "owner reconciled {} entr{}",
            owner.reconciler.len(),
            if owner.reconciler.len() == 1 { "y" } else { "ies" }
        );

        owner.node.shutdown().await;
        member.node.shutdown().await;
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MeshConfig::from_env()?,
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_logging(LogConfig::try_from(&config.logging)?)?;
    metrics::init_metrics();

    let sim = Sim {
        config,
        rendezvous: MemoryRendezvous::new(),
        network: MemoryNetwork::new(),
        deadline: Duration::from_secs(args.timeout),
    };

    let result = match args.command {
        Command::Converge {
            peers,
            messages,
            dump,
        } => sim.converge(peers, messages, dump).await,
        Command::Revoke => sim.revoke().await,
    };
    if let Err(err) = &result {
        warn!(error = %err, "Simulation failed");
    }
    result
}
