//! pack - Cloud Native Buildpacks CLI
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use cnb_pack::cli::{commands, Cli, Commands, LogFormat};
use cnb_pack::client::Client;
use cnb_pack::config::ConfigManager;
use cnb_pack::error::PackResult;
use cnb_pack::ui::UiContext;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("ERROR:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, format: LogFormat) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("cnb_pack=warn"),
        1 => EnvFilter::new("cnb_pack=info"),
        _ => EnvFilter::new("cnb_pack=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.without_time().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run() -> PackResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);
    let ctx = UiContext::detect();

    // Commands that never touch the engine or the config
    match cli.command {
        Commands::Completion(args) => return commands::completion(args),
        Commands::SuggestBuilders => return commands::suggest_builders(&ctx),
        Commands::SuggestStacks => return commands::suggest_stacks(&ctx),
        _ => {}
    }

    let manager = ConfigManager::new();
    debug!("Using config {}", manager.path().display());
    if let Commands::SetDefaultBuilder(args) = cli.command {
        return commands::set_default_builder(args, &manager, &ctx).await;
    }

    let config = manager.load().await?;
    let client = Client::from_config(config, ctx.is_interactive())?;

    match cli.command {
        Commands::Build(args) => commands::build(args, &client, &ctx, cli.verbose > 0).await,
        Commands::Rebase(args) => commands::rebase(args, &client, &ctx).await,
        Commands::CreateBuilder(args) => commands::create_builder(args, &client, &ctx).await,
        Commands::InspectBuilder(args) => commands::inspect_builder(args, &client, &ctx).await,
        Commands::InspectImage(args) => commands::inspect_image(args, &client, &ctx).await,
        Commands::Completion(_)
        | Commands::SuggestBuilders
        | Commands::SuggestStacks
        | Commands::SetDefaultBuilder(_) => Ok(()),
    }
}
