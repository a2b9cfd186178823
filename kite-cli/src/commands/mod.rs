use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::Result;
use thiserror::Error;

use kite::Config;

pub mod poll;
pub mod validate;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
}

pub struct CliContext<'a> {
    pub config: &'a Config,
    pub matches: &'a ArgMatches,
    pub quiet: bool,
}

impl<'a> CliContext<'a> {
    pub fn new(config: &'a Config, matches: &'a ArgMatches, quiet: bool) -> Self {
        Self {
            config,
            matches,
            quiet,
        }
    }

    /// Print a progress line for humans, unless running quietly.
    pub fn say<S: AsRef<str>>(&self, line: S) {
        if !self.quiet {
            println!("{}", line.as_ref());
        }
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<()>;
}
