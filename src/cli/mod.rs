pub mod options;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::{
    storage::{
        schema::{keys, StorageMap, TimerMode},
        store::{KeyValueStore, LocalStore},
    },
    tracker::{bootstrap, start_tracker},
    utils::{
        clock::DefaultClock,
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX, HOST_PREFIX},
    },
};

use options::{process_options_command, process_today_command, OptionsArgs};

#[derive(Parser, Debug)]
#[command(name = "Surftally", version, long_about = None)]
#[command(about = "Tracks active time per website domain", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Off,
    Default,
    Green,
    Blue,
}

impl From<ModeArg> for TimerMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Off => TimerMode::Off,
            ModeArg::Default => TimerMode::Default,
            ModeArg::Green => TimerMode::Green,
            ModeArg::Blue => TimerMode::Blue,
        }
    }
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(
        about = "Run the tracking host on stdin/stdout. Meant to be launched by the browser through native messaging"
    )]
    Serve {},
    #[command(about = "Show or change the user options")]
    Options {
        #[command(flatten)]
        options: OptionsArgs,
    },
    #[command(about = "Switch the timer mode")]
    Mode { mode: ModeArg },
    #[command(about = "Print today's total time and top sites")]
    Today {},
    #[command(about = "Delete all tracked data. User options are kept")]
    Reset {},
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let app_dir = args.dir.map_or_else(create_application_default_path, Ok)?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    let log_prefix = match args.commands {
        Commands::Serve {} => HOST_PREFIX,
        _ => CLI_PREFIX,
    };
    enable_logging(log_prefix, &app_dir, logging_level, args.log)?;

    match args.commands {
        Commands::Serve {} => start_tracker(app_dir).await,
        Commands::Options { options } => {
            let store = open_store(&app_dir).await?;
            process_options_command(&store, options).await
        }
        Commands::Mode { mode } => {
            let store = open_store(&app_dir).await?;
            let mut update = StorageMap::new();
            update.insert(
                keys::TIMER_MODE.into(),
                serde_json::to_value(TimerMode::from(mode))?,
            );
            store.set(update).await?;
            Ok(())
        }
        Commands::Today {} => {
            let store = open_store(&app_dir).await?;
            process_today_command(&store).await
        }
        Commands::Reset {} => {
            let store = open_store(&app_dir).await?;
            bootstrap::reset_all_data(&store, &DefaultClock).await
        }
    }
}

/// Opens the shared store and makes sure it has the initial layout, so the
/// subcommands behave the same before and after the first host run.
async fn open_store(app_dir: &std::path::Path) -> Result<LocalStore> {
    let store = LocalStore::open(app_dir.join("storage.json")).await?;
    bootstrap::ensure_initialized(&store, &DefaultClock).await?;
    Ok(store)
}
