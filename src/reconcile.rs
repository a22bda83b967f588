//! Diffing a scrape pass against the stored snapshot.
//!
//! Listings are matched per source on their identity key only. A source whose
//! fetch failed is left exactly as it was: no removals are derived from it.

use crate::models::{IdentityKind, Listing, ListingKey, MessageRef};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// What one source produced in this pass.
#[derive(Debug, Clone)]
pub enum ScrapeOutcome {
    /// The fetch succeeded; these are the listings that survived normalization.
    Fetched(Vec<Listing>),
    /// The fetch itself failed. Prior listings of the source are kept as they are.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SourcePass {
    pub source_id: String,
    pub outcome: ScrapeOutcome,
    /// Keys of cards still on the source that could not be normalized.
    /// They count as seen but are not refreshed, added or reactivated.
    pub incomplete_keys: Vec<String>,
}

impl SourcePass {
    pub fn fetched(source_id: impl Into<String>, listings: Vec<Listing>) -> Self {
        Self {
            source_id: source_id.into(),
            outcome: ScrapeOutcome::Fetched(listings),
            incomplete_keys: Vec::new(),
        }
    }

    pub fn with_incomplete(mut self, keys: Vec<String>) -> Self {
        self.incomplete_keys = keys;
        self
    }

    pub fn failed(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            outcome: ScrapeOutcome::Failed(reason.into()),
            incomplete_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Full snapshot to persist, every status included.
    pub all: Vec<Listing>,
    pub new: Vec<Listing>,
    pub removed: Vec<Listing>,
    pub reactivated: Vec<Listing>,
    /// Sources whose fetch failed and were carried over untouched.
    pub skipped_sources: Vec<String>,
}

impl Reconciliation {
    pub fn has_changes(&self) -> bool {
        !(self.new.is_empty() && self.removed.is_empty() && self.reactivated.is_empty())
    }

    /// Record the message a dispatcher produced for `key` in the snapshot and
    /// in whichever output set still holds the listing.
    pub fn apply_message_ref(&mut self, key: &ListingKey, message_ref: MessageRef) -> bool {
        for listing in self
            .new
            .iter_mut()
            .chain(self.reactivated.iter_mut())
            .chain(self.removed.iter_mut())
            .filter(|listing| listing.key() == *key)
        {
            listing.message_ref = Some(message_ref.clone());
        }
        set_message_ref(&mut self.all, key, message_ref)
    }
}

pub fn set_message_ref(listings: &mut [Listing], key: &ListingKey, message_ref: MessageRef) -> bool {
    match listings.iter_mut().find(|listing| listing.key() == *key) {
        Some(listing) => {
            listing.message_ref = Some(message_ref);
            true
        }
        None => false,
    }
}

/// Diff every pass against `previous`.
///
/// Listings of sources without a pass, and of sources whose pass failed,
/// come through in `all` unchanged and in their original order. New listings
/// are appended after the existing ones.
pub fn reconcile(previous: Vec<Listing>, passes: Vec<SourcePass>, today: NaiveDate) -> Reconciliation {
    let mut result = Reconciliation {
        all: previous,
        ..Default::default()
    };

    for pass in passes {
        match pass.outcome {
            ScrapeOutcome::Fetched(scraped) => {
                reconcile_source(&mut result, &pass.source_id, scraped, &pass.incomplete_keys, today);
            }
            ScrapeOutcome::Failed(reason) => {
                warn!(source = %pass.source_id, %reason, "fetch failed, keeping previous listings untouched");
                result.skipped_sources.push(pass.source_id);
            }
        }
    }

    info!(
        total = result.all.len(),
        new = result.new.len(),
        removed = result.removed.len(),
        reactivated = result.reactivated.len(),
        "reconciliation finished"
    );
    result
}

fn reconcile_source(
    result: &mut Reconciliation,
    source_id: &str,
    scraped: Vec<Listing>,
    incomplete_keys: &[String],
    today: NaiveDate,
) {
    let index: HashMap<String, usize> = result
        .all
        .iter()
        .enumerate()
        .filter(|(_, listing)| listing.source_id == source_id)
        .map(|(position, listing)| (listing.identity_key.clone(), position))
        .collect();

    let mut seen = HashSet::new();
    for listing in dedupe(source_id, scraped) {
        seen.insert(listing.identity_key.clone());

        let Some(&position) = index.get(&listing.identity_key) else {
            debug!(source = source_id, key = %listing.identity_key, "new listing");
            result.new.push(listing.clone());
            result.all.push(listing);
            continue;
        };

        let existing = &mut result.all[position];
        if existing.active {
            existing.refresh_from(&listing, today);
        } else if existing.manual_override {
            debug!(source = source_id, key = %existing.identity_key, "listing held by operator, not reactivating");
        } else {
            debug!(source = source_id, key = %existing.identity_key, "listing reactivated");
            existing.reactivate_from(&listing, today);
            result.reactivated.push(existing.clone());
        }
    }

    for key in incomplete_keys {
        if index.contains_key(key) && seen.insert(key.clone()) {
            debug!(source = source_id, key = %key, "listing still listed but incomplete, left as it is");
        }
    }

    let mut unseen: Vec<usize> = index
        .iter()
        .filter(|(key, _)| !seen.contains(*key))
        .map(|(_, &position)| position)
        .collect();
    unseen.sort_unstable();

    for position in unseen {
        let existing = &mut result.all[position];
        if existing.active {
            debug!(source = source_id, key = %existing.identity_key, "listing removed");
            existing.deactivate(today);
            result.removed.push(existing.clone());
        }
    }
}

/// Drop scraped listings from other sources and collapse repeated keys;
/// the last occurrence wins but keeps the position of the first.
fn dedupe(source_id: &str, scraped: Vec<Listing>) -> Vec<Listing> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Listing> = Vec::with_capacity(scraped.len());

    for listing in scraped {
        if listing.source_id != source_id {
            warn!(
                expected = source_id,
                found = %listing.source_id,
                key = %listing.identity_key,
                "ignoring listing from another source"
            );
            continue;
        }
        match positions.get(&listing.identity_key) {
            Some(&position) => {
                debug!(source = source_id, key = %listing.identity_key, "duplicate key in one pass, keeping the later one");
                unique[position] = listing;
            }
            None => {
                positions.insert(listing.identity_key.clone(), unique.len());
                unique.push(listing);
            }
        }
    }
    unique
}

/// Listings of `source_id` whose stored key was not built with `kind`.
pub fn identity_drift(listings: &[Listing], source_id: &str, kind: IdentityKind) -> usize {
    listings
        .iter()
        .filter(|listing| listing.source_id == source_id && !listing.identity_matches(kind))
        .count()
}

/// One-time migration of a source's stored keys to `kind`.
///
/// When two stored listings collapse onto the same new key the one that is
/// active (or, failing that, the later one) is kept, and its message
/// reference falls back to the other's if it has none. Returns how many keys
/// changed.
pub fn rekey_source(listings: &mut Vec<Listing>, source_id: &str, kind: IdentityKind) -> usize {
    let mut changed = 0;
    for listing in listings.iter_mut().filter(|listing| listing.source_id == source_id) {
        let key = kind.key_of(&listing.url, &listing.address);
        if listing.identity_key != key {
            listing.identity_key = key;
            changed += 1;
        }
    }

    let mut kept: Vec<Listing> = Vec::with_capacity(listings.len());
    let mut positions: HashMap<ListingKey, usize> = HashMap::new();
    for listing in listings.drain(..) {
        let key = listing.key();
        match positions.get(&key) {
            Some(&position) => {
                let earlier = &mut kept[position];
                let replace = listing.active || !earlier.active;
                warn!(key = %key, "two listings share a key after rekeying, merging");
                if replace {
                    let fallback_ref = earlier.message_ref.take();
                    *earlier = listing;
                    if earlier.message_ref.is_none() {
                        earlier.message_ref = fallback_ref;
                    }
                } else if earlier.message_ref.is_none() {
                    earlier.message_ref = listing.message_ref;
                }
            }
            None => {
                positions.insert(key, kept.len());
                kept.push(listing);
            }
        }
    }
    *listings = kept;
    changed
}
