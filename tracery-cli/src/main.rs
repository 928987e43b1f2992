//! tracery-cli: talk to a running Tracery server over its Unix socket
//!
//! # Subcommands
//! - `replay <file.json> [--session <id>]`: record a JSON array of events and finalize
//! - `stats`: in-memory session statistics
//! - `templates`: list stored workflow templates
//! - `template <uuid>`: one template with its recorded instances
//! - `ping`: check the server answers

use std::path::{Path, PathBuf};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracery_core::ipc::{TraceryRequest, TraceryResponse};
use tracery_core::models::CapturedEvent;
use uuid::Uuid;

const DEFAULT_SOCKET: &str = "/tmp/tracery.sock";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "tracery-cli",
    version,
    about = "Replay recorded sessions into Tracery and inspect workflow templates"
)]
struct Cli {
    /// Server socket path (overrides TRACERY_SOCKET env var)
    #[arg(long, env = "TRACERY_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Print the raw response data as pretty JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Record every event of a JSON file into one session, then finalize it
    Replay {
        /// JSON array of captured events
        file: PathBuf,

        /// Session id (defaults to the file name)
        #[arg(long)]
        session: Option<String>,
    },

    /// Show in-memory session statistics
    Stats,

    /// List stored workflow templates
    Templates,

    /// Show one template and its instances
    Template {
        id: Uuid,
    },

    /// Check the server is reachable
    Ping,
}

// ============================================================================
// IPC client
// ============================================================================

struct Client {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl Client {
    async fn connect(socket: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", socket.display(), e))?;
        let codec = LengthDelimitedCodec::builder().little_endian().new_codec();
        Ok(Self {
            framed: Framed::new(stream, codec),
        })
    }

    /// Send one request and wait for its response. Error responses become `Err`.
    async fn call(&mut self, request: &TraceryRequest) -> anyhow::Result<serde_json::Value> {
        let payload = rmp_serde::to_vec_named(request)?;
        self.framed.send(Bytes::from(payload)).await?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("server closed the connection"))??;
        let response: TraceryResponse = rmp_serde::from_slice(&frame)?;

        if response.is_ok() {
            Ok(response.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(anyhow::anyhow!(
                "server error: {}",
                response.error.unwrap_or_else(|| "unknown".to_string())
            ))
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Session id derived from the replay file name, e.g. `sessions/crm.json` → `crm`.
fn session_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "replay".to_string())
}

async fn do_replay(
    client: &mut Client,
    file: &Path,
    session: Option<String>,
) -> anyhow::Result<serde_json::Value> {
    let raw = tokio::fs::read_to_string(file).await?;
    let events: Vec<CapturedEvent> = serde_json::from_str(&raw)?;
    let session_id = session.unwrap_or_else(|| session_from_path(file));

    client
        .call(&TraceryRequest::StartRecording {
            session_id: session_id.clone(),
        })
        .await?;

    let total = events.len();
    for event in events {
        client
            .call(&TraceryRequest::RecordEvent {
                session_id: session_id.clone(),
                event,
            })
            .await?;
    }
    eprintln!("Recorded {} events into session {}", total, session_id);

    client.call(&TraceryRequest::Finalize { session_id }).await
}

fn print_human(command: &Commands, data: &serde_json::Value) {
    match command {
        Commands::Ping => println!("Tracery server: up"),
        Commands::Stats => {
            println!("Active sessions:     {}", data["active_sessions"]);
            println!("Buffered events:     {}", data["total_events"]);
            println!("Finalizing sessions: {}", data["finalizing_sessions"]);
            println!("Segmenter:           {}", data["segmenter"].as_str().unwrap_or("?"));
        }
        Commands::Replay { .. } => {
            let screens = data["screens"].as_array().map(Vec::len).unwrap_or(0);
            println!("Session {}: {} screens", data["session_id"].as_str().unwrap_or("?"), screens);
            for instance in data["instances"].as_array().into_iter().flatten() {
                let mark = if instance["succeeded"].as_bool().unwrap_or(false) { "✓" } else { "✗" };
                println!(
                    "  {} {} ({} steps) → template {}",
                    mark,
                    instance["goal"].as_str().unwrap_or(""),
                    instance["steps"],
                    instance["templateId"].as_str().unwrap_or("?"),
                );
            }
        }
        Commands::Templates => {
            let templates = data["templates"].as_array().cloned().unwrap_or_default();
            if templates.is_empty() {
                eprintln!("No templates stored yet");
                return;
            }
            for t in &templates {
                println!(
                    "{}  {} ({} steps)",
                    t["id"].as_str().unwrap_or("?"),
                    t["name"].as_str().unwrap_or(""),
                    t["steps"],
                );
            }
        }
        Commands::Template { .. } => {
            let template = &data["template"];
            println!("{}", template["name"].as_str().unwrap_or(""));
            println!("{}\n", template["description"].as_str().unwrap_or(""));
            for step in template["steps"].as_array().into_iter().flatten() {
                println!(
                    "  {}. [{}] {}",
                    step["stepNumber"],
                    step["screenPattern"].as_str().unwrap_or(""),
                    step["actionTemplate"].as_str().unwrap_or(""),
                );
            }
            let instances = data["instances"].as_array().map(Vec::len).unwrap_or(0);
            println!("\n{} recorded instance(s)", instances);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut client = Client::connect(&cli.socket).await?;

    let data = match &cli.command {
        Commands::Replay { file, session } => do_replay(&mut client, file, session.clone()).await?,
        Commands::Stats => client.call(&TraceryRequest::Stats).await?,
        Commands::Templates => client.call(&TraceryRequest::ListTemplates).await?,
        Commands::Template { id } => client.call(&TraceryRequest::GetTemplate { id: *id }).await?,
        Commands::Ping => client.call(&TraceryRequest::Ping).await?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print_human(&cli.command, &data);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("tracery-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
