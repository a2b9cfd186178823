#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{command, Arg, ArgAction};
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::Command;

mod commands;

use kite::log::*;
use kite::Config;

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;

    // Command configuration
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output except errors. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the config file. Defaults to kite.yml next to the kite executable.")
                .global(true),
        )
        .subcommand(
            command!("poll")
                .about("Poll the platform once and dispatch newly finished jobs.")
                .arg(
                    Arg::new("dry")
                        .help("Don't run hooks, publish or save anything, just show what would happen.")
                        .short('d')
                        .long("dry")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("validate")
                .about("Validate the config and list the hooks found for every event."),
        )
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    let logging_config = if quiet && verbose == 0 {
        logging_config.with_max_level(LevelFilter::ERROR)
    } else {
        let level = match verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        logging_config.with_max_level(level)
    };

    let subscriber = logging_config.finish();
    subscriber.init();

    // Load the config before anything touches the network
    let config_path = match matches.get_one::<String>("config") {
        Some(path) => PathBuf::from(path),
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)
        .wrap_err_with(|| format!("loading config from {}", config_path.display()))?;

    // Run the commands
    if let Some((subcommand, sub_matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(&config, sub_matches, quiet && verbose == 0);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &sub_matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "poll" => commands::poll::PollCommand::new().run(&ctx).await?,
            "validate" => commands::validate::ValidateCommand::new().run(&ctx).await?,
            _ => return Err(commands::CommandErrors::InvalidSubcommand(subcommand.to_string()).into()),
        }
    }
    Ok(())
}
