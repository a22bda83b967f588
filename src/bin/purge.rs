use anyhow::{bail, Result};
use clap::Parser;
use hyresvakt::config::Config;
use hyresvakt::debug;
use hyresvakt::notify::discord::DiscordNotifier;
use hyresvakt::notify::Dispatcher;
use std::str::FromStr;

#[derive(Debug, Clone, Copy)]
enum Amount {
    All,
    Count(u8),
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Amount::All);
        }
        match s.parse::<u8>() {
            Ok(n) if (1..=100).contains(&n) => Ok(Amount::Count(n)),
            _ => Err("choose a number between 1 and 100 or 'all'".to_string()),
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Delete recent messages from the notification channel")]
struct Args {
    /// How many of the latest messages to delete (1-100), or "all"
    amount: Amount,

    /// Enable debug output
    #[clap(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    debug::init_logging(args.debug);
    let config = Config::from_env()?;
    let mut notifier = DiscordNotifier::connect(config.require_discord()?, config.ready_timeout)?;

    let mut deleted = 0;
    match args.amount {
        Amount::Count(n) => {
            let messages = notifier.recent_messages(n)?;
            deleted += notifier.bulk_delete(&messages);
        }
        Amount::All => loop {
            let messages = notifier.recent_messages(100)?;
            if messages.is_empty() {
                break;
            }
            let batch = notifier.bulk_delete(&messages);
            if batch == 0 {
                bail!("no messages could be deleted, stopping after {} deletions", deleted);
            }
            deleted += batch;
        },
    }

    println!("✅ Deleted {} messages.", deleted);
    Ok(())
}
