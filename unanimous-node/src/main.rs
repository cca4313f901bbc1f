//! Unanimous node
//!
//! Runs a two-phase commit coordinator or participant.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use error_stack::{Report, ResultExt};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tracing::info;
use unanimous::{CommitConfig, Coordinator, NodeId, Participant};
use unanimous_node::{
    ApprovalMode, CliApprover, DirArtifacts, DirItems, NodeError, TcpTransport, listen, log_path,
    parse_peer, submit_all,
};

/// Unanimous two-phase commit node
#[derive(Parser, Debug)]
#[command(name = "unanimous-node")]
#[command(about = "Run a two-phase commit coordinator or participant")]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Read commit requests from stdin and drive them to completion
    Coordinator(CoordinatorArgs),
    /// Vote on and apply commits touching local items
    Participant(ParticipantArgs),
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    /// This node's id, as peers know it
    #[arg(long)]
    id: NodeId,

    /// Address to accept protocol messages on
    #[arg(short, long)]
    listen: String,

    /// Another node, as id=host:port (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, String)>,

    /// Directory holding the log and data files
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,
}

#[derive(clap::Args, Debug)]
struct CoordinatorArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Milliseconds between checks for a vote decision
    #[arg(long, default_value_t = 200)]
    vote_poll_ms: u64,

    /// Checks before an undecided vote is aborted
    #[arg(long, default_value_t = 17)]
    vote_poll_attempts: u32,

    /// Milliseconds between EXEC/ABORT resends
    #[arg(long, default_value_t = 300)]
    resend_ms: u64,
}

#[derive(clap::Args, Debug)]
struct ParticipantArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Id of the coordinator; must also be given as a --peer
    #[arg(long)]
    coordinator: NodeId,

    /// How to answer vote requests
    #[arg(long, value_enum, default_value_t = ApprovalMode::Always)]
    approve: ApprovalMode,
}

async fn bind(addr: &str) -> Result<TcpListener, Report<NodeError>> {
    let listener = TcpListener::bind(addr)
        .await
        .change_context(NodeError)
        .attach_with(|| format!("binding {addr}"))?;
    if let Ok(local) = listener.local_addr() {
        info!(%local, "listening");
    }
    Ok(listener)
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Report<NodeError>> {
    let node = args.node;
    let listener = bind(&node.listen).await?;
    let artifacts = DirArtifacts::open(&node.data_dir)
        .change_context(NodeError)
        .attach_with(|| format!("opening data directory {}", node.data_dir.display()))?;
    let config = CommitConfig::default()
        .with_vote_poll_interval(Duration::from_millis(args.vote_poll_ms))
        .with_vote_poll_attempts(args.vote_poll_attempts)
        .with_resend_interval(Duration::from_millis(args.resend_ms));

    let coordinator = Coordinator::recover(
        node.id.clone(),
        log_path(&node.data_dir, &node.id),
        TcpTransport::new(node.peers.into_iter().collect()),
        artifacts,
        config,
    )
    .change_context(NodeError)?;
    tokio::spawn(coordinator.clone().serve(listen(listener)));

    info!(id = %node.id, "coordinator ready, reading requests from stdin");
    submit_all(BufReader::new(tokio::io::stdin()), &coordinator).await;

    // In-flight tasks keep resending until every participant answers.
    futures::future::pending::<()>().await;
    Ok(())
}

async fn run_participant(args: ParticipantArgs) -> Result<(), Report<NodeError>> {
    let node = args.node;
    let peers: HashMap<NodeId, String> = node.peers.into_iter().collect();
    if !peers.contains_key(&args.coordinator) {
        return Err(Report::new(NodeError)
            .attach(format!("no --peer address for coordinator {}", args.coordinator)));
    }

    let listener = bind(&node.listen).await?;
    let items_dir = node.data_dir.join("items");
    let items = DirItems::open(&items_dir)
        .change_context(NodeError)
        .attach_with(|| format!("opening item directory {}", items_dir.display()))?;

    let participant = Participant::recover(
        node.id.clone(),
        args.coordinator,
        log_path(&node.data_dir, &node.id),
        TcpTransport::new(peers),
        items,
        CliApprover::stdin(args.approve),
    )
    .change_context(NodeError)?;

    info!(id = %node.id, approve = ?args.approve, "participant ready");
    participant.serve(listen(listener)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Report<NodeError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.role {
        Role::Coordinator(args) => run_coordinator(args).await,
        Role::Participant(args) => run_participant(args).await,
    }
}
