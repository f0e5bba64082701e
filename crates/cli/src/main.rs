// Courier CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Talk to the server API only; the CLI never touches the database.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier CLI - Seed shops, produce events and watch webhook delivery")]
#[command(version)]
pub struct Cli {
    /// API base URL
    #[arg(long, env = "COURIER_API_URL", default_value = "http://localhost:9000")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create demo shops with registrations pointing at the test receiver
    Seed {
        /// Receiver webhook URL
        #[arg(
            long,
            env = "COURIER_RECEIVER_URL",
            default_value = "http://localhost:3001/webhook"
        )]
        receiver_url: String,
    },

    /// List shops and their registration counts
    Shops,

    /// Produce events that are admitted immediately
    Produce {
        /// Shop ID
        shop: Uuid,

        /// Number of events
        #[arg(default_value = "1")]
        count: usize,

        /// Event type
        #[arg(long, default_value = "order.created")]
        event_type: String,
    },

    /// Bulk-insert events, admitting only while there is no backpressure
    Flood {
        /// Shop ID
        shop: Uuid,

        /// Number of events
        #[arg(default_value = "100")]
        count: usize,

        /// Store events without admitting any; the drain picks them up
        #[arg(long)]
        db_only: bool,
    },

    /// Show queue depths, backpressure and delivery metrics
    Stats {
        /// Refresh every N seconds until Ctrl-C
        #[arg(long, short, value_name = "SECS")]
        watch: Option<u64>,

        /// Reset delivery metrics first
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = client::Client::new(&cli.api_url);
    let output_format = output::OutputFormat::parse(&cli.output);

    match cli.command {
        Commands::Seed { receiver_url } => {
            commands::seed::run(&client, output_format, cli.quiet, &receiver_url).await
        }
        Commands::Shops => commands::shops::run(&client, output_format).await,
        Commands::Produce {
            shop,
            count,
            event_type,
        } => {
            commands::events::produce(&client, output_format, cli.quiet, shop, count, &event_type)
                .await
        }
        Commands::Flood {
            shop,
            count,
            db_only,
        } => commands::events::flood(&client, output_format, cli.quiet, shop, count, db_only).await,
        Commands::Stats { watch, clear } => {
            commands::stats::run(&client, output_format, watch, clear).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flood_args() {
        let shop = Uuid::now_v7();
        let cli = Cli::try_parse_from([
            "courier",
            "-o",
            "json",
            "flood",
            &shop.to_string(),
            "500",
            "--db-only",
        ])
        .unwrap();

        assert_eq!(cli.output, "json");
        match cli.command {
            Commands::Flood {
                shop: parsed,
                count,
                db_only,
            } => {
                assert_eq!(parsed, shop);
                assert_eq!(count, 500);
                assert!(db_only);
            }
            _ => panic!("expected flood"),
        }
    }

    #[test]
    fn test_produce_defaults_to_one_event() {
        let shop = Uuid::now_v7();
        let cli = Cli::try_parse_from(["courier", "produce", &shop.to_string()]).unwrap();
        assert!(matches!(cli.command, Commands::Produce { count: 1, .. }));
    }
}
