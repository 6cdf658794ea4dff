//! Courier session simulator.
//!
//! Runs one signed-in session against the in-process simulated server,
//! cutting the connection while messages are in flight, and checks the
//! session invariants once everything has settled.
//!
//! # Usage
//!
//! ```bash
//! # Ten sends, three dropped connections
//! courier-sim --messages 10 --drops 3
//!
//! # Server confirms without correlation ids, noisy logs
//! courier-sim --no-correlation --log-level debug
//! ```

mod scenario;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::scenario::{Scenario, ScenarioConfig};

/// Courier session simulator
#[derive(Parser, Debug)]
#[command(name = "courier-sim")]
#[command(about = "Drive a Courier session through simulated connection loss")]
#[command(version)]
struct Args {
    /// Local user id
    #[arg(short, long, default_value = "alice")]
    user: String,

    /// Conversation to send into
    #[arg(short, long, default_value = "C1")]
    conversation: String,

    /// RNG seed for correlation ids
    #[arg(short, long, default_value = "0")]
    seed: u64,

    /// Messages to send
    #[arg(short, long, default_value = "5")]
    messages: usize,

    /// Times the server drops the connection mid-run
    #[arg(short, long, default_value = "2")]
    drops: usize,

    /// Failed connect attempts after each drop
    #[arg(long, default_value = "1")]
    failed_connects: usize,

    /// Messages another user sends into the conversation
    #[arg(long, default_value = "3")]
    incoming: usize,

    /// Confirm sends without echoing correlation ids
    #[arg(long)]
    no_correlation: bool,

    /// Seconds to wait for the session to settle
    #[arg(long, default_value = "60")]
    settle_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(user = %args.user, seed = args.seed, "Courier simulator starting");

    let config = ScenarioConfig {
        user: args.user,
        conversation: args.conversation,
        seed: args.seed,
        messages: args.messages,
        drops: args.drops,
        failed_connects: args.failed_connects,
        incoming: args.incoming,
        echo_correlation: !args.no_correlation,
        settle_timeout: std::time::Duration::from_secs(args.settle_secs),
    };

    let report = Scenario::new(config).run().await?;

    tracing::info!(
        messages = report.messages,
        unread = report.unread,
        published = report.published,
        connect_attempts = report.connect_attempts,
        "simulation passed"
    );

    Ok(())
}
