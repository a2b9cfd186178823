use std::collections::BTreeSet;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use kite::dispatch::HookRunner;
use kite::log::*;
use kite::store::DedupStore;

use super::CliContext;

pub struct ValidateCommand;

impl ValidateCommand {
    async fn inspect_hooks(&self, context: &CliContext<'_>) {
        let hooks = context.config.hooks();
        if !*hooks.enabled() {
            context.say("** hooks: disabled");
            return;
        }
        context.say(format!(
            "** hooks: {} (timeout {}s)",
            hooks.directory().display(),
            hooks.timeout_secs()
        ));

        let runner = HookRunner::new(hooks);
        let events: BTreeSet<&String> = hooks.events().values().collect();
        for event in events {
            context.say(format!("*** event: {}", event));
            for (cmd, _) in hooks.events().iter().filter(|(_, e)| *e == event) {
                context.say(format!("**** on: {}", cmd));
            }
            let discovered = runner.discover(event).await;
            if discovered.is_empty() {
                context.say("**** no hooks");
            }
            for hook in discovered {
                let state = if *hook.executable() {
                    "executable"
                } else {
                    "NOT executable, will be skipped"
                };
                context.say(format!("**** hook: {} ({})", hook.path().display(), state));
            }
        }
    }
}

#[async_trait]
impl<'a> super::Command<'a> for ValidateCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let config = context.config;
        info!("config is valid.");
        context.say("* config is valid.");
        context.say(format!("** platform: {}", config.platform().base_url()));

        self.inspect_hooks(context).await;

        let queue = config.queue();
        if *queue.enabled() {
            context.say(format!(
                "** queue: {} -> {} ({:?})",
                queue.url().as_deref().unwrap_or_default(),
                queue.destination().as_deref().unwrap_or_default(),
                queue.mode()
            ));
        } else {
            context.say("** queue: disabled");
        }

        let store = DedupStore::new(config.state().path());
        let processed = store.load().await;
        context.say(format!(
            "** job cursor: {} ({} processed jobs)",
            store.path().display(),
            processed.len()
        ));
        Ok(())
    }
}
