use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use raft_consensus::config::{NodeConfig, PeerConfig};
use raft_consensus::node::Node;
use raft_consensus::proto::client_service_client::ClientServiceClient;
use raft_consensus::proto::{
    command, Command, DeleteAction, GetLogRequest, GetRequest, GetStatusRequest, PutAction,
    SetConnectivityRequest, SubmitRequest,
};
use raft_consensus::shutdown::install_shutdown_handler;

/// Upper bound on leader redirects followed for one submission.
const MAX_REDIRECTS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "raft-consensus")]
#[command(version)]
#[command(about = "A replicated key/value store on Raft consensus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a server node
    Server(ServerArgs),

    /// Set a key through the leader
    Put {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
        value: String,
    },

    /// Remove a key through the leader
    Delete {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
    },

    /// Read a key from the contacted node's applied state
    Get {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
    },

    /// Show the contacted node's Raft status
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Dump the contacted node's log
    Log {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Re-join a node that was disconnected
    Connect {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Cut a node off from its peers (fault injection)
    Disconnect {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "b:127.0.0.1:50052,c:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Base election timeout in milliseconds
    #[arg(long, default_value = "300")]
    election_timeout_ms: u64,

    /// Random extra delay added to each election timeout (defaults to the timeout)
    #[arg(long)]
    election_jitter_ms: Option<u64>,

    /// Deadline for each peer RPC in milliseconds
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,

    /// Directory for durable term, vote and log (in memory when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Client identity used to de-duplicate retried submissions
    #[arg(long)]
    client_id: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    success: bool,
    served_by: String,
    leader_hint: String,
}

#[derive(Serialize)]
struct GetOutput {
    key: String,
    found: bool,
    value: Option<String>,
}

#[derive(Serialize)]
struct StatusOutput {
    server_id: String,
    role: String,
    current_term: i64,
    leader_id: String,
    commit_index: i64,
    last_applied: i64,
    last_log_index: i64,
    connected: bool,
}

#[derive(Serialize)]
struct LogEntryOutput {
    index: usize,
    term: i64,
    client_id: String,
    sequence: u64,
    action: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str) -> Result<Vec<PeerConfig>, String> {
    if peers_str.trim().is_empty() {
        return Ok(Vec::new());
    }

    peers_str
        .split(',')
        .map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            match parts.as_slice() {
                [id, host, port] if !id.is_empty() && !host.is_empty() => Ok(PeerConfig {
                    node_id: id.to_string(),
                    addr: format!("{}:{}", host, port),
                }),
                _ => Err(format!(
                    "invalid peer {:?}, expected id:host:port",
                    peer.trim()
                )),
            }
        })
        .collect()
}

fn with_scheme(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

/// Replace a wildcard bind address with the host the client already used.
fn reachable_addr(leader_addr: &str, original_addr: &str) -> String {
    match leader_addr.strip_prefix("0.0.0.0:") {
        Some(port) => {
            let original_host = original_addr
                .trim_start_matches("http://")
                .trim_start_matches("https://")
                .split(':')
                .next()
                .unwrap_or("127.0.0.1");
            format!("{}:{}", original_host, port)
        }
        None => leader_addr.to_string(),
    }
}

async fn connect(addr: &str) -> Result<ClientServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(with_scheme(addr))?.connect().await?;
    Ok(ClientServiceClient::new(channel))
}

fn default_client_id() -> String {
    format!("cli-{}", uuid::Uuid::new_v4())
}

fn next_sequence() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let peers = parse_peers(&args.peers)?;

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers,
        election_timeout_ms: args.election_timeout_ms,
        election_jitter_ms: args
            .election_jitter_ms
            .unwrap_or(args.election_timeout_ms),
        rpc_timeout_ms: args.rpc_timeout_ms,
        data_dir: args.data_dir,
    };

    tracing::info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        data_dir = ?config.data_dir,
        peers = ?config.peers.iter().map(|p| format!("{}@{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting raft-consensus node"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config)?.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_submit(
    client_args: &ClientArgs,
    action: command::Action,
) -> Result<(), Box<dyn std::error::Error>> {
    let command = Command {
        client_id: client_args
            .client_id
            .clone()
            .unwrap_or_else(default_client_id),
        sequence: next_sequence(),
        action: Some(action),
    };

    let mut addr = client_args.addr.clone();
    for _ in 0..=MAX_REDIRECTS {
        let mut client = connect(&addr).await?;
        let resp = client
            .submit(SubmitRequest {
                command: Some(command.clone()),
            })
            .await?
            .into_inner();

        if resp.success {
            match client_args.output {
                OutputFormat::Json => {
                    let output = SubmitOutput {
                        success: true,
                        served_by: addr.clone(),
                        leader_hint: resp.leader_hint,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => println!("OK (committed via {})", addr),
            }
            return Ok(());
        }

        if resp.leader_addr.is_empty() {
            eprintln!("Error: no leader known, retry later");
            std::process::exit(1);
        }
        let leader_addr = reachable_addr(&resp.leader_addr, &addr);
        eprintln!(
            "Not committed by {}, redirecting to {} at {}...",
            addr, resp.leader_hint, leader_addr
        );
        addr = leader_addr;
    }

    eprintln!(
        "Error: gave up after {} redirects without reaching a leader",
        MAX_REDIRECTS
    );
    std::process::exit(1);
}

async fn handle_get(
    client_args: &ClientArgs,
    key: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&client_args.addr).await?;
    let resp = client
        .get(GetRequest { key: key.clone() })
        .await?
        .into_inner();

    match client_args.output {
        OutputFormat::Json => {
            let output = GetOutput {
                key,
                found: resp.found,
                value: resp.found.then_some(resp.value),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if resp.found {
                println!("{}", resp.value);
            } else {
                println!("(not found)");
            }
        }
    }
    Ok(())
}

async fn handle_status(client_args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&client_args.addr).await?;
    let resp = client
        .get_status(GetStatusRequest {})
        .await?
        .into_inner();

    match client_args.output {
        OutputFormat::Json => {
            let output = StatusOutput {
                server_id: resp.server_id,
                role: resp.role,
                current_term: resp.current_term,
                leader_id: resp.leader_id,
                commit_index: resp.commit_index,
                last_applied: resp.last_applied,
                last_log_index: resp.last_log_index,
                connected: resp.connected,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Node Status");
            println!("{}", "=".repeat(40));
            println!("Server:       {}", resp.server_id);
            println!("Role:         {}", resp.role);
            println!("Term:         {}", resp.current_term);
            println!(
                "Leader:       {}",
                if resp.leader_id.is_empty() {
                    "unknown"
                } else {
                    &resp.leader_id
                }
            );
            println!("Commit index: {}", resp.commit_index);
            println!("Last applied: {}", resp.last_applied);
            println!("Log length:   {}", resp.last_log_index);
            println!("Connected:    {}", resp.connected);
        }
    }
    Ok(())
}

async fn handle_log(client_args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&client_args.addr).await?;
    let resp = client.get_log(GetLogRequest {}).await?.into_inner();

    let entries: Vec<LogEntryOutput> = resp
        .entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let command = entry.command.unwrap_or_default();
            let action = match command.action {
                Some(command::Action::Put(put)) => format!("put {}={}", put.key, put.value),
                Some(command::Action::Delete(delete)) => format!("delete {}", delete.key),
                None => "-".to_string(),
            };
            LogEntryOutput {
                index: i + 1,
                term: entry.term,
                client_id: command.client_id,
                sequence: command.sequence,
                action,
            }
        })
        .collect();

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Table => {
            println!("{:<8} {:<8} {:<30} ACTION", "INDEX", "TERM", "CLIENT");
            println!("{}", "-".repeat(70));
            for entry in &entries {
                println!(
                    "{:<8} {:<8} {:<30} {}",
                    entry.index,
                    entry.term,
                    format!("{}#{}", entry.client_id, entry.sequence),
                    entry.action
                );
            }
            println!();
            println!("{} entries", entries.len());
        }
    }
    Ok(())
}

async fn handle_connectivity(
    client_args: &ClientArgs,
    connected: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&client_args.addr).await?;
    let resp = client
        .set_connectivity(SetConnectivityRequest { connected })
        .await?
        .into_inner();

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::json!({ "connected": resp.connected })),
        OutputFormat::Table => println!(
            "{} is now {}",
            client_args.addr,
            if resp.connected {
                "connected"
            } else {
                "disconnected"
            }
        ),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Put { client, key, value } => {
            handle_submit(&client, command::Action::Put(PutAction { key, value })).await?;
        }
        Commands::Delete { client, key } => {
            handle_submit(&client, command::Action::Delete(DeleteAction { key })).await?;
        }
        Commands::Get { client, key } => {
            handle_get(&client, key).await?;
        }
        Commands::Status { client } => {
            handle_status(&client).await?;
        }
        Commands::Log { client } => {
            handle_log(&client).await?;
        }
        Commands::Connect { client } => {
            handle_connectivity(&client, true).await?;
        }
        Commands::Disconnect { client } => {
            handle_connectivity(&client, false).await?;
        }
    }

    Ok(())
}
