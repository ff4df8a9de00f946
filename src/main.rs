//! peercall - peer-to-peer voice and video calls from the terminal
//!
//! Calls are negotiated over a low-latency message bus and carried over
//! WebRTC; missed calls are recorded in the REST backend's message log.

mod api;
mod auth;
mod bus;
mod calling;
mod config;
mod models;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::CallKind;

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Peer-to-peer voice and video calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store an access token issued by the backend
    Login {
        /// Your participant id
        #[arg(long)]
        user_id: String,

        /// Access token for the bus and REST API
        #[arg(long)]
        token: String,

        /// Token lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,

        /// Name shown to the people you call
        #[arg(long)]
        name: Option<String>,
    },

    /// Log out and clear cached credentials
    Logout,

    /// Show current identity and configuration
    Whoami,

    /// Call another participant
    Call {
        /// Participant id to call
        peer: String,

        /// Make a video call instead of a voice call
        #[arg(long)]
        video: bool,

        /// Hang up after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Wait for incoming calls
    Listen {
        /// Answer incoming calls instead of declining them
        #[arg(long)]
        auto_accept: bool,
    },

    /// Run two in-process participants through a call and a declined call
    Demo {
        /// Use video calls
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

fn call_kind(video: bool) -> CallKind {
    if video {
        CallKind::Video
    } else {
        CallKind::Voice
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            user_id,
            token,
            expires_in,
            name,
        } => {
            auth::login(&user_id, &token, expires_in, name).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout().await?;
        }
        Commands::Whoami => {
            auth::status().await?;
        }
        Commands::Call {
            peer,
            video,
            duration,
        } => {
            calling::console::run_call(&peer, call_kind(video), duration).await?;
        }
        Commands::Listen { auto_accept } => {
            calling::console::run_listen(auto_accept).await?;
        }
        Commands::Demo { video, duration } => {
            calling::console::run_demo(call_kind(video), duration).await?;
        }
    }

    Ok(())
}
