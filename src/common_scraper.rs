use crate::debug;
use crate::models::{Candidate, IdentityKind, Listing};
use crate::normalizer::{self, Rejection};
use crate::reconcile::SourcePass;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rand::Rng;
use reqwest::blocking::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ScrapingOptions {
    /// Base pause between detail-page requests; a random jitter is added.
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
    /// Where rejected candidates are dumped; `None` disables the dump.
    pub debug_dir: Option<PathBuf>,
}

impl Default for ScrapingOptions {
    fn default() -> Self {
        Self {
            request_delay_ms: 500,
            timeout_secs: 30,
            debug_dir: None,
        }
    }
}

/// A landlord site. Implementations only extract candidates; matching
/// against earlier runs happens in [`crate::reconcile`].
pub trait PlatformScraper {
    /// Stable id stored on every listing, e.g. `"subo"`.
    fn source_id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str;

    /// The field this source is matched on. Fixed for the life of the source;
    /// changing it needs a `--rekey` migration.
    fn identity(&self) -> IdentityKind;

    fn fetch_candidates(&self, client: &Client, options: &ScrapingOptions) -> Result<Vec<Candidate>>;
}

pub fn build_client(options: &ScrapingOptions) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(options.timeout_secs))
        .user_agent(USER_AGENT)
        .cookie_store(true)
        .build()
        .context("Failed to create HTTP client")
}

/// Sleep between requests to the same site.
pub fn polite_delay(options: &ScrapingOptions) {
    if options.request_delay_ms == 0 {
        return;
    }
    let jitter = rand::thread_rng().gen_range(0..=options.request_delay_ms / 2);
    std::thread::sleep(Duration::from_millis(options.request_delay_ms + jitter));
}

/// Result of one source's scrape, ready for reconciliation.
#[derive(Debug)]
pub struct ScrapeReport {
    pub pass: SourcePass,
    pub accepted: usize,
    pub rejected: Vec<Rejection>,
    /// How many cards the adapter returned before normalization.
    pub candidates: usize,
}

impl ScrapeReport {
    pub fn failed(&self) -> bool {
        matches!(self.pass.outcome, crate::reconcile::ScrapeOutcome::Failed(_))
    }
}

/// Fetch and normalize one source. A fetch error becomes a failed pass so
/// that its listings are not mistaken for removed ones.
pub fn scrape_source<T: PlatformScraper + ?Sized>(
    scraper: &T,
    client: &Client,
    options: &ScrapingOptions,
    today: NaiveDate,
) -> ScrapeReport {
    info!(source = scraper.source_id(), "scraping {}", scraper.name());

    let candidates = match scraper.fetch_candidates(client, options) {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(source = scraper.source_id(), error = %format!("{e:#}"), "fetch failed");
            return ScrapeReport {
                pass: SourcePass::failed(scraper.source_id(), format!("{e:#}")),
                accepted: 0,
                rejected: Vec::new(),
                candidates: 0,
            };
        }
    };

    let normalized = normalize_all(scraper, &candidates, options, today);
    info!(
        source = scraper.source_id(),
        candidates = candidates.len(),
        accepted = normalized.listings.len(),
        rejected = normalized.rejected.len(),
        "normalized candidates"
    );

    ScrapeReport {
        accepted: normalized.listings.len(),
        pass: SourcePass::fetched(scraper.source_id(), normalized.listings)
            .with_incomplete(normalized.incomplete_keys),
        rejected: normalized.rejected,
        candidates: candidates.len(),
    }
}

struct Normalized {
    listings: Vec<Listing>,
    rejected: Vec<Rejection>,
    incomplete_keys: Vec<String>,
}

fn normalize_all<T: PlatformScraper + ?Sized>(
    scraper: &T,
    candidates: &[Candidate],
    options: &ScrapingOptions,
    today: NaiveDate,
) -> Normalized {
    let mut listings = Vec::with_capacity(candidates.len());
    let mut rejected = Vec::new();
    let mut incomplete_keys = Vec::new();

    for candidate in candidates {
        match normalizer::normalize(candidate, scraper.source_id(), scraper.identity(), today) {
            Ok(listing) => listings.push(listing),
            Err(rejection) => {
                warn!(
                    source = scraper.source_id(),
                    url = candidate.url.as_deref().unwrap_or("-"),
                    missing = %rejection.missing.join(", "),
                    "rejected candidate"
                );
                if let Some(dir) = &options.debug_dir {
                    let n = rejected.len() + 1;
                    if let Err(e) = debug::dump_rejected(dir, scraper.source_id(), n, candidate, &rejection) {
                        warn!(error = %format!("{e:#}"), "could not write rejected candidate");
                    }
                }
                if let Some(key) = normalizer::identity_key(candidate, scraper.identity()) {
                    incomplete_keys.push(key);
                }
                rejected.push(rejection);
            }
        }
    }

    Normalized {
        listings,
        rejected,
        incomplete_keys,
    }
}
