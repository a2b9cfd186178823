use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use kite::log::*;
use kite::poller::Poller;

use super::CliContext;

pub struct PollCommand;

#[async_trait]
impl<'a> super::Command<'a> for PollCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let dry = context.matches.get_flag("dry");
        let poller = Poller::new(context.config)?.dry_run(dry);
        if dry {
            context.say("* dry run: nothing will be executed, published or saved");
        }

        info!("polling {}", context.config.platform().base_url());
        let summary = poller.run().await.wrap_err("poll run failed")?;
        context.say(format!("* {}", summary));
        if *summary.hook_failures() > 0 {
            warn!("{} hooks failed during this run", summary.hook_failures());
        }
        Ok(())
    }
}
