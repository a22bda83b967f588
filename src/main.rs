use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use hyresvakt::common_scraper::{self, ScrapingOptions};
use hyresvakt::config::Config;
use hyresvakt::debug;
use hyresvakt::models::Listing;
use hyresvakt::notify::discord::DiscordNotifier;
use hyresvakt::notify::{self, Dispatcher, Pacer};
use hyresvakt::reconcile::{self, ScrapeOutcome};
use hyresvakt::scrapers;
use hyresvakt::store::Store;
use hyresvakt::tui::RunTUI;
use hyresvakt::utils;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Hyresvakt - watches landlord sites for vacant apartments")]
#[clap(group(ArgGroup::new("operation").multiple(false)))]
struct Args {
    /// Path to the listings snapshot
    #[clap(short, long, default_value = "listings.json")]
    output: PathBuf,

    /// Only process these sources (repeatable); default is all
    #[clap(short, long)]
    source: Vec<String>,

    /// Enable debug output and dump incomplete listings
    #[clap(short, long)]
    debug: bool,

    /// Scrape and diff, but send nothing and save nothing
    #[clap(long)]
    dry_run: bool,

    /// Do not resend active listings that were never announced
    #[clap(long)]
    skip_recheck: bool,

    /// Take a listing down by its key; scrapes will not revive it (needs one --source)
    #[clap(long, value_name = "KEY", group = "operation")]
    remove: Option<String>,

    /// Lift an earlier --remove (needs one --source)
    #[clap(long, value_name = "KEY", group = "operation")]
    restore: Option<String>,

    /// Delete every announced message and forget the references
    #[clap(long, group = "operation")]
    clear: bool,

    /// Delete inactive listings and their messages from the snapshot
    #[clap(long, group = "operation")]
    purge_inactive: bool,

    /// Rebuild stored keys with each selected source's identity field
    #[clap(long, group = "operation")]
    rekey: bool,

    /// Write the snapshot as CSV to this path
    #[clap(long, value_name = "CSV", group = "operation")]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    debug::init_logging(args.debug);
    let config = Config::from_env()?;

    let store = Store::new(&args.output);
    let _lock = store.lock()?;
    let mut tui = RunTUI::new(!args.debug);

    let snapshot = store.load();
    if let Some(moved) = &snapshot.quarantined {
        tui.show_degraded(&moved.display().to_string())?;
    }
    let mut listings = snapshot.listings;
    tui.show_loaded(listings.len(), listings.iter().filter(|l| l.active).count())?;

    if let Some(path) = &args.export {
        utils::export_listings_to_csv(&listings, path)?;
        println!("Exported {} listings to {}", listings.len(), path.display());
        return Ok(());
    }
    if let Some(key) = &args.remove {
        return remove_listing(&args, &config, &store, &mut listings, key);
    }
    if let Some(key) = &args.restore {
        return restore_listing(&args, &store, &mut listings, key);
    }
    if args.clear || args.purge_inactive {
        return clear_messages(&args, &config, &store, &mut listings);
    }
    if args.rekey {
        return rekey(&args, &store, &mut listings);
    }

    run_pass(&args, &config, &store, &mut tui, listings)
}

fn run_pass(args: &Args, config: &Config, store: &Store, tui: &mut RunTUI, listings: Vec<Listing>) -> Result<()> {
    let today = utils::today();
    let scrapers = scrapers::select_scrapers(&args.source);
    let options = ScrapingOptions {
        debug_dir: args.debug.then(|| config.debug_dir.clone()),
        ..Default::default()
    };
    let client = common_scraper::build_client(&options)?;

    // Connect before scraping so an unreachable chat aborts the run with nothing written.
    let mut notifier = if args.dry_run {
        None
    } else {
        let discord = config.require_discord()?;
        Some(
            DiscordNotifier::connect(discord, config.ready_timeout)
                .context("Chat connection not ready, aborting without saving")?,
        )
    };

    let mut passes = Vec::with_capacity(scrapers.len());
    for scraper in &scrapers {
        let drift = reconcile::identity_drift(&listings, scraper.source_id(), scraper.identity());
        if drift > 0 {
            warn!(
                source = scraper.source_id(),
                drift,
                identity = %scraper.identity(),
                "stored keys do not match the source's identity field; run with --rekey"
            );
            tui.show_skipped_source(scraper.name(), &format!("{drift} stored keys need --rekey"))?;
            continue;
        }

        tui.start_source(scraper.name())?;
        let report = common_scraper::scrape_source(scraper.as_ref(), &client, &options, today);
        tui.finish_source(scraper.name(), &report)?;

        if let ScrapeOutcome::Fetched(found) = &report.pass.outcome {
            let active_before = listings
                .iter()
                .filter(|l| l.source_id == scraper.source_id() && l.active)
                .count();
            if found.is_empty() && active_before > 0 {
                warn!(
                    source = scraper.source_id(),
                    active_before,
                    candidates = report.candidates,
                    incomplete = report.pass.incomplete_keys.len(),
                    "source returned no usable listings; active ones not on the page will be marked removed"
                );
            }
        }
        passes.push(report.pass);
    }

    let mut result = reconcile::reconcile(listings, passes, today);

    let Some(notifier) = notifier.as_mut() else {
        print_changes("New", &result.new);
        print_changes("Reactivated", &result.reactivated);
        print_changes("Removed", &result.removed);
        tui.show_summary(&result, None, false)?;
        return Ok(());
    };

    let mut pacer = Pacer::new(config.dispatch_spacing);
    let progress = tui.dispatch_progress();
    let mut report = notify::dispatch_changes(notifier, &mut result, &mut pacer, &progress);
    if !args.skip_recheck {
        let resent = notify::resend_missing(notifier, &mut result, &mut pacer);
        report.sent += resent.sent;
        report.failed.extend(resent.failed);
    }

    store
        .save(&result.all)
        .context("Failed to save snapshot; stored state is stale")?;
    tui.show_summary(&result, Some(&report), true)?;
    Ok(())
}

fn print_changes(label: &str, listings: &[Listing]) {
    for listing in listings {
        println!(
            "  {} [{}] {} | {} | {} | {}",
            label, listing.source_id, listing.address, listing.price, listing.rooms, listing.url
        );
    }
}

fn single_source(args: &Args) -> Result<&str> {
    match args.source.as_slice() {
        [source] => Ok(source.as_str()),
        _ => bail!("this operation needs exactly one --source"),
    }
}

fn find_listing<'a>(listings: &'a mut [Listing], source: &str, key: &str) -> Result<&'a mut Listing> {
    listings
        .iter_mut()
        .find(|l| l.source_id == source && l.identity_key == key)
        .with_context(|| format!("No listing {source}:{key} in the snapshot"))
}

fn remove_listing(args: &Args, config: &Config, store: &Store, listings: &mut [Listing], key: &str) -> Result<()> {
    let source = single_source(args)?;
    let listing = find_listing(listings, source, key)?;
    let was_active = listing.active;
    listing.hold(utils::today());
    let held = listing.clone();

    if was_active && held.message_ref.is_some() && !args.dry_run {
        match &config.discord {
            Some(discord) => {
                let mut notifier = DiscordNotifier::connect(discord, config.ready_timeout)?;
                if let Err(e) = notifier.update_removed(&held) {
                    warn!(key = %held.key(), error = %e, "could not update the message");
                }
            }
            None => warn!("no chat credentials, message left as it is"),
        }
    }

    if !args.dry_run {
        store.save(listings).context("Failed to save snapshot")?;
    }
    println!("Removed {} (held until --restore)", held.key());
    Ok(())
}

fn restore_listing(args: &Args, store: &Store, listings: &mut [Listing], key: &str) -> Result<()> {
    let source = single_source(args)?;
    let listing = find_listing(listings, source, key)?;
    if !listing.manual_override {
        bail!("{} is not held", listing.key());
    }
    listing.release_hold();
    let restored = listing.key();

    if !args.dry_run {
        store.save(listings).context("Failed to save snapshot")?;
    }
    println!("Restored {}; it comes back the next time it is scraped", restored);
    Ok(())
}

fn clear_messages(args: &Args, config: &Config, store: &Store, listings: &mut Vec<Listing>) -> Result<()> {
    if args.dry_run {
        let count = listings
            .iter()
            .filter(|l| l.message_ref.is_some() && (args.clear || (!l.active && !l.manual_override)))
            .count();
        println!("Would delete {} messages", count);
        return Ok(());
    }

    let mut notifier = DiscordNotifier::connect(config.require_discord()?, config.ready_timeout)?;
    let mut pacer = Pacer::new(config.dispatch_spacing);

    if args.clear {
        let deleted = notify::clear_messages(&mut notifier, listings, &mut pacer, |_| true);
        println!("Deleted {} messages", deleted);
    } else {
        let purgeable = |l: &Listing| !l.active && !l.manual_override;
        let deleted = notify::clear_messages(&mut notifier, listings, &mut pacer, purgeable);
        let before = listings.len();
        // A listing whose message survived stays so the delete can be retried.
        listings.retain(|l| !purgeable(l) || l.message_ref.is_some());
        println!("Deleted {} messages, purged {} listings", deleted, before - listings.len());
    }

    store.save(listings).context("Failed to save snapshot")?;
    Ok(())
}

fn rekey(args: &Args, store: &Store, listings: &mut Vec<Listing>) -> Result<()> {
    let mut changed = 0;
    for scraper in scrapers::select_scrapers(&args.source) {
        let count = reconcile::rekey_source(listings, scraper.source_id(), scraper.identity());
        info!(source = scraper.source_id(), identity = %scraper.identity(), count, "rekeyed listings");
        changed += count;
    }
    if !args.dry_run {
        store.save(listings).context("Failed to save snapshot")?;
    }
    println!("Rekeyed {} listings", changed);
    Ok(())
}
