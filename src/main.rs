//! Sandbox sessions - repository sandboxes with a browser terminal.
//!
//! Usage:
//!   sandbox-sessions serve [--port 8080]          # Start HTTP server
//!   sandbox-sessions create <owner> <repo>        # Provision a sandbox
//!   sandbox-sessions status <id>                  # One status read
//!   sandbox-sessions watch <id>                   # Follow the countdown
//!   sandbox-sessions stop <id>                    # Stop a sandbox

use clap::{Args, Parser, Subcommand};
use sandbox_sessions::{
    http_server, AppState, ClientState, HttpSandboxProvider, MemoryProvider, ProviderKind,
    SandboxClient, SandboxProvider, ServeArgs, SessionTracker, WatchOptions,
};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sandbox-sessions")]
#[command(about = "Repository sandboxes with a browser terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ServerArg {
    /// Base URL of a running sandbox-sessions server
    #[arg(long, env = "SANDBOX_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Create a sandbox for a repository
    Create {
        owner: String,
        repo: String,
        #[command(flatten)]
        server: ServerArg,
    },
    /// Stop a sandbox
    Stop {
        id: String,
        #[command(flatten)]
        server: ServerArg,
    },
    /// Print the status of a sandbox
    Status {
        id: String,
        #[command(flatten)]
        server: ServerArg,
    },
    /// Follow a sandbox until it is gone
    Watch {
        id: String,
        #[command(flatten)]
        server: ServerArg,
        /// Countdown refresh interval in milliseconds
        #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
        tick_ms: u64,
        /// Server poll interval in milliseconds
        #[arg(long, default_value = "5000", value_parser = clap::value_parser!(u64).range(1..))]
        poll_ms: u64,
    },
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    exit(1);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }
}

async fn serve(args: ServeArgs) {
    let provider: Arc<dyn SandboxProvider> = match args.provider {
        ProviderKind::Http => match HttpSandboxProvider::new(args.provider_config()) {
            Ok(provider) => Arc::new(provider),
            Err(e) => fail(e),
        },
        ProviderKind::Memory => Arc::new(MemoryProvider::default()),
    };
    let state = AppState::new(provider, args.sandbox_config());

    if let Err(e) = http_server::run_server(args.port, state).await {
        fail(e);
    }
}

async fn watch(client: SandboxClient, id: String, options: WatchOptions) {
    let mut tracker = SessionTracker::resume(id);
    let mut last = ClientState::Unknown;
    client
        .watch(&mut tracker, options, |tracker| {
            let state = tracker.state();
            match state {
                ClientState::Running { remaining } => {
                    println!("Running | Dies in {}s", remaining.as_secs());
                }
                ClientState::Expired if last != state => {
                    println!("Expired, waiting for server confirmation");
                }
                ClientState::Absent => println!("Sandbox is gone"),
                _ => {}
            }
            last = state;
        })
        .await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Create { owner, repo, server } => {
            match SandboxClient::new(server.server).create(&owner, &repo).await {
                Ok(created) => print_json(&created),
                Err(e) => fail(e),
            }
        }
        Commands::Stop { id, server } => {
            if let Err(e) = SandboxClient::new(server.server).stop(&id).await {
                fail(e);
            }
        }
        Commands::Status { id, server } => {
            match SandboxClient::new(server.server).status(&id).await {
                Ok(status) => print_json(&status),
                Err(e) => fail(e),
            }
        }
        Commands::Watch {
            id,
            server,
            tick_ms,
            poll_ms,
        } => {
            let options = WatchOptions {
                tick: Duration::from_millis(tick_ms),
                poll: Duration::from_millis(poll_ms),
            };
            watch(SandboxClient::new(server.server), id, options).await;
        }
    }
}
