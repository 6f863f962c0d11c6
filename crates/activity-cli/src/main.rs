mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, reconcile::ReconcileArgs, track::TrackArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "guild-activity",
    about = "Work out who in the guild is active from chat logs and keep the active role in sync",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root holding data/, output/ and logs/ (default: auto-detect)
    #[arg(long, global = true, env = "GUILD_ACTIVITY_ROOT")]
    root: Option<PathBuf>,

    /// Discord bot token (overrides discord.bot_token in data/config.yaml)
    #[arg(long, global = true, env = "DISCORD_BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the active set from channel history and write the artifact
    Track(TrackArgs),

    /// Grant or revoke the active role to match the artifact
    Reconcile(ReconcileArgs),

    /// Inspect and validate data/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let token = cli.token.as_deref();

    let result = match cli.command {
        Commands::Track(args) => cmd::track::run(&root, args, token, cli.json),
        Commands::Reconcile(args) => cmd::reconcile::run(&root, args, token, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
