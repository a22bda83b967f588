use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub channel_id: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` when no credentials are set; only dispatching needs them.
    pub discord: Option<DiscordConfig>,
    pub dispatch_spacing: Duration,
    pub ready_timeout: Duration,
    pub debug_dir: PathBuf,
}

impl Config {
    /// Read from the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let discord = match (var("DISCORD_BOT_TOKEN"), var("DISCORD_CHANNEL_ID")) {
            (Some(token), Some(channel)) => {
                let channel_id: u64 = channel
                    .parse()
                    .with_context(|| format!("DISCORD_CHANNEL_ID is not a number: {channel}"))?;
                if channel_id == 0 {
                    bail!("DISCORD_CHANNEL_ID must not be 0");
                }
                Some(DiscordConfig { token, channel_id })
            }
            (None, None) => None,
            (Some(_), None) => bail!("DISCORD_BOT_TOKEN is set but DISCORD_CHANNEL_ID is missing"),
            (None, Some(_)) => bail!("DISCORD_CHANNEL_ID is set but DISCORD_BOT_TOKEN is missing"),
        };

        let millis = |name: &str, default: u64| -> Result<u64> {
            var(name)
                .map(|v| v.parse().with_context(|| format!("{name} is not a number: {v}")))
                .unwrap_or(Ok(default))
        };

        Ok(Self {
            discord,
            dispatch_spacing: Duration::from_millis(millis("DISPATCH_SPACING_MS", 1000)?),
            ready_timeout: Duration::from_secs(millis("DISPATCH_READY_TIMEOUT_SECS", 30)?),
            debug_dir: var("DEBUG_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("debug_output")),
        })
    }

    pub fn require_discord(&self) -> Result<&DiscordConfig> {
        self.discord
            .as_ref()
            .ok_or_else(|| anyhow!("Discord credentials missing: set DISCORD_BOT_TOKEN and DISCORD_CHANNEL_ID"))
    }
}
