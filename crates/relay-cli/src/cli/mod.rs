//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::core::interrupt;
use relay_core::{config, logging};

mod commands;

#[derive(Parser)]
#[command(name = "relay")]
#[command(version = "0.1")]
#[command(about = "Terminal chat client for a remote agent server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Arguments for starting or resuming a chat.
#[derive(clap::Args, Debug, Clone, Default)]
struct ChatArgs {
    /// Recipe file (YAML or JSON) to bind to a new session
    #[arg(long, value_name = "FILE")]
    recipe: Option<PathBuf>,

    /// Recipe parameter value (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Resume an existing session by ID
    #[arg(long, value_name = "SESSION_ID", conflicts_with = "new")]
    resume: Option<String>,

    /// Always start a fresh session
    #[arg(long)]
    new: bool,

    /// Working directory reported to the agent (default: config or cwd)
    #[arg(long, env = "RELAY_WORKING_DIR", value_name = "DIR")]
    working_dir: Option<PathBuf>,

    /// Accept the recipe without asking
    #[arg(long)]
    yes: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Chat with the agent (default)
    Chat(ChatArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect recipe files
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Set the agent server URL
    SetServer {
        #[arg(value_name = "URL")]
        url: String,
    },
}

#[derive(clap::Subcommand)]
enum RecipeCommands {
    /// Show used and missing parameters and acceptance state
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Parameter value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Print the recipe prompt with parameters substituted
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Parameter value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = config::Config::load().context("load config")?;
    let _log_guard = logging::init(&config.logging).context("init logging")?;

    let Some(command) = cli.command else {
        return chat(ChatArgs::default(), &config).await;
    };

    match command {
        Commands::Chat(args) => chat(args, &config).await,
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::SetServer { url } => commands::config::set_server(&url),
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::Check { file, params } => {
                commands::recipe::check(&file, &params).await
            }
            RecipeCommands::Render { file, params } => commands::recipe::render(&file, &params),
        },
    }
}

async fn chat(args: ChatArgs, config: &config::Config) -> Result<()> {
    interrupt::install()?;
    commands::chat::run(
        commands::chat::ChatRunOptions {
            recipe: args.recipe,
            params: args.params,
            resume: if args.new { None } else { args.resume },
            working_dir: args.working_dir,
            auto_accept: args.yes,
        },
        config,
    )
    .await
}
