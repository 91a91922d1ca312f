//! CLI entry point for partkeeper-sessions: session store maintenance tool.

use clap::{Args, Parser, Subcommand};
use partkeeper::config::{load_config, Config};
use partkeeper::session::store::SessionStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "partkeeper-sessions",
    about = "Inspect and prune PartKeeper upload sessions"
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Configuration file to read `sessions.uri` from.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session store URI; takes precedence over the configuration file.
    #[arg(long, global = true)]
    uri: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every session as JSON
    List,
    /// Show one session and its recorded parts
    Show { upload_id: String },
    /// Delete one session locally (the remote upload is left untouched)
    Delete { upload_id: String },
}

fn resolve_uri(args: &StoreArgs) -> anyhow::Result<String> {
    if let Some(uri) = &args.uri {
        return Ok(uri.clone());
    }
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok())?;
    Ok(config.sessions.uri)
}

async fn run(command: Commands, store: &dyn SessionStore) -> anyhow::Result<String> {
    match command {
        Commands::List => {
            let sessions = store.list_sessions().await?;
            Ok(serde_json::to_string_pretty(&sessions)?)
        }
        Commands::Show { upload_id } => {
            let session = store
                .get_session(&upload_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no session with upload id {upload_id}"))?;
            let parts = store.list_parts(&upload_id).await?;
            Ok(serde_json::to_string_pretty(&serde_json::json!({
                "session": session,
                "parts": parts,
            }))?)
        }
        Commands::Delete { upload_id } => {
            if store.delete_session(&upload_id).await? {
                Ok(format!("Deleted session {upload_id}"))
            } else {
                anyhow::bail!("no session with upload id {upload_id}")
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let uri = match resolve_uri(&cli.store) {
        Ok(uri) => uri,
        Err(e) => {
            eprintln!("Error reading config: {e:#}");
            std::process::exit(1);
        }
    };
    let store = match partkeeper::session::connect(&uri) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening session store {uri}: {e:#}");
            std::process::exit(1);
        }
    };

    match run(cli.command, store.as_ref()).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
