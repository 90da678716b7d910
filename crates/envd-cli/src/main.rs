mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{up::UpArgs, CommandError};
use envd_core::{
    install_signal_handler, new_engine, CancelToken, CoreError, EngineSettings, EnvironmentEngine,
};
use envd_schema::{Context, ContextConfig};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "envd",
    version,
    about = "Start, inspect and tear down reproducible development environments"
)]
struct Cli {
    /// Context to use instead of the current one.
    #[arg(long, global = true)]
    context: Option<String>,

    /// Container runtime for docker contexts (`docker` or `mock`).
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Path to the docker binary. Falls back to `ENVD_DOCKER`.
    #[arg(long, global = true)]
    docker_bin: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start an environment from an image.
    Up(UpArgs),
    /// Remove an environment and its image.
    Destroy { name: String },
    /// Pause a running environment.
    Pause { name: String },
    /// Resume a paused environment.
    Resume { name: String },
    /// List environments.
    Ls,
    /// List envd images.
    Images,
    /// Show an environment with its ports and packages.
    Describe { name: String },
    /// Show the packages an environment or image was built with.
    Deps {
        name: String,
        /// Treat NAME as an image reference.
        #[arg(long, default_value_t = false)]
        image: bool,
    },
    /// Show the port bindings of an environment.
    Ports { name: String },
    /// Generate shell completions.
    Completions { shell: Shell },
}

fn load_context(name: Option<&str>) -> Result<Context, CommandError> {
    let config = ContextConfig::load_default().map_err(CoreError::from)?;
    let context = match name {
        Some(n) => config.get(n),
        None => config.current_context(),
    }
    .map_err(CoreError::from)?;
    Ok(context.clone())
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ENVD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.code)
        }
    }
}

fn run(cli: Cli) -> commands::CommandResult {
    let json = cli.json;
    let engine = || -> Result<Box<dyn EnvironmentEngine>, CommandError> {
        let context = load_context(cli.context.as_deref())?;
        let cancel = CancelToken::new();
        install_signal_handler(cancel.clone());
        let settings = EngineSettings {
            docker_bin: cli
                .docker_bin
                .clone()
                .or_else(|| std::env::var("ENVD_DOCKER").ok()),
            cancel,
            ..EngineSettings::default()
        };
        Ok(new_engine(&context, cli.runtime.as_deref(), settings)?)
    };

    match cli.command {
        Commands::Up(args) => commands::up::run(engine()?.as_ref(), &args, json),
        Commands::Destroy { name } => commands::destroy::run(engine()?.as_ref(), &name, json),
        Commands::Pause { name } => commands::pause::run(engine()?.as_ref(), &name, json),
        Commands::Resume { name } => commands::resume::run(engine()?.as_ref(), &name, json),
        Commands::Ls => commands::ls::run(engine()?.as_ref(), json),
        Commands::Images => commands::images::run(engine()?.as_ref(), json),
        Commands::Describe { name } => commands::describe::run(engine()?.as_ref(), &name, json),
        Commands::Deps { name, image } => {
            commands::deps::run(engine()?.as_ref(), &name, image, json)
        }
        Commands::Ports { name } => commands::ports::run(engine()?.as_ref(), &name, json),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    }
}
