//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Build container images from source with Cloud Native Buildpacks
#[derive(Parser, Debug)]
#[command(name = "pack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info and phase output, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate an app image from source code
    Build(BuildArgs),

    /// Rebase app image layers onto a new run image
    Rebase(RebaseArgs),

    /// Create a builder image from a builder config
    CreateBuilder(CreateBuilderArgs),

    /// Show information about a builder
    InspectBuilder(InspectBuilderArgs),

    /// Show information about an app image
    InspectImage(InspectImageArgs),

    /// Set the builder used when `build` is given none
    SetDefaultBuilder(SetDefaultBuilderArgs),

    /// List recommended builders
    SuggestBuilders,

    /// List recommended stacks
    SuggestStacks,

    /// Output shell completion script
    Completion(CompletionArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Name of the image to build
    pub image: String,

    /// Path to the app directory (defaults to current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Builder image
    #[arg(short = 'B', long)]
    pub builder: Option<String>,

    /// Run image (defaults to the builder's run image)
    #[arg(long)]
    pub run_image: Option<String>,

    /// Build-time environment file, one KEY=VALUE per line
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Build-time environment variable (KEY=VALUE, or KEY to copy it)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Buildpack id@version, directory, archive or URL; repeat to set the group
    #[arg(short = 'b', long = "buildpack")]
    pub buildpacks: Vec<String>,

    /// Publish to the registry instead of the daemon
    #[arg(long)]
    pub publish: bool,

    /// Clear the build cache before building
    #[arg(long)]
    pub clear_cache: bool,

    /// Skip pulling builder and run images
    #[arg(long)]
    pub no_pull: bool,
}

/// Arguments for the rebase command
#[derive(Parser, Debug)]
pub struct RebaseArgs {
    /// App image to rebase
    pub image: String,

    /// Run image to rebase onto (defaults to the one recorded on the image)
    #[arg(long)]
    pub run_image: Option<String>,

    /// Publish to the registry instead of the daemon
    #[arg(long)]
    pub publish: bool,

    /// Skip pulling images
    #[arg(long)]
    pub no_pull: bool,

    /// Additional tag to save the rebased image under
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,
}

/// Arguments for the create-builder command
#[derive(Parser, Debug)]
pub struct CreateBuilderArgs {
    /// Name of the builder image to create
    pub image: String,

    /// Path to builder.toml
    #[arg(short = 'b', long)]
    pub builder_config: PathBuf,

    /// Publish to the registry instead of the daemon
    #[arg(long)]
    pub publish: bool,

    /// Skip pulling the build image
    #[arg(long)]
    pub no_pull: bool,
}

/// Arguments for the inspect-builder command
#[derive(Parser, Debug)]
pub struct InspectBuilderArgs {
    /// Builder image (defaults to the default builder)
    pub image: Option<String>,
}

/// Arguments for the inspect-image command
#[derive(Parser, Debug)]
pub struct InspectImageArgs {
    /// App image name
    pub image: String,

    /// Print the bill of materials as JSON
    #[arg(long)]
    pub bom: bool,
}

/// Arguments for the set-default-builder command
#[derive(Parser, Debug)]
pub struct SetDefaultBuilderArgs {
    /// Builder image; prompts with suggested builders when omitted
    pub name: Option<String>,
}

/// Arguments for the completion command
#[derive(Parser, Debug)]
pub struct CompletionArgs {
    /// Target shell
    #[arg(long, value_enum, default_value = "bash")]
    pub shell: Shell,

    /// Also write the script under PACK_HOME and print its path
    #[arg(long)]
    pub save: bool,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build() {
        let cli = Cli::parse_from([
            "pack",
            "build",
            "my/app",
            "--builder",
            "cnb/builder",
            "-e",
            "A=1",
            "--env-file",
            "build.env",
            "-b",
            "bp.one@1.0",
            "-b",
            "./local-bp",
            "--no-pull",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.image, "my/app");
                assert_eq!(args.builder.as_deref(), Some("cnb/builder"));
                assert_eq!(args.env, vec!["A=1"]);
                assert_eq!(args.env_files, vec![PathBuf::from("build.env")]);
                assert_eq!(args.buildpacks, vec!["bp.one@1.0", "./local-bp"]);
                assert!(args.no_pull);
                assert!(!args.publish);
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_parses_rebase_tags() {
        let cli = Cli::parse_from(["pack", "rebase", "my/app", "-t", "my/app:v2", "--publish"]);
        match cli.command {
            Commands::Rebase(args) => {
                assert!(args.publish);
                assert_eq!(args.tags, vec!["my/app:v2"]);
            }
            _ => panic!("expected Rebase command"),
        }
    }

    #[test]
    fn create_builder_requires_config() {
        assert!(Cli::try_parse_from(["pack", "create-builder", "my/builder"]).is_err());
        let cli = Cli::parse_from(["pack", "create-builder", "my/builder", "-b", "builder.toml"]);
        assert!(matches!(cli.command, Commands::CreateBuilder(_)));
    }

    #[test]
    fn global_flags() {
        let cli = Cli::parse_from(["pack", "-vv", "suggest-stacks", "--log-format", "json"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::SuggestStacks));
    }

    #[test]
    fn completion_defaults_to_bash() {
        let cli = Cli::parse_from(["pack", "completion"]);
        match cli.command {
            Commands::Completion(args) => assert_eq!(args.shell, Shell::Bash),
            _ => panic!("expected Completion command"),
        }
    }
}
