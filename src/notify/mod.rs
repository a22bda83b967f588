//! Delivering change notifications and feeding message references back.
//!
//! Delivery is best effort: one failed call is logged and the batch moves
//! on. A listing whose send failed keeps no reference and is sent again by
//! [`resend_missing`] on the next run.

pub mod discord;

use crate::models::{Listing, ListingKey, MessageRef};
use crate::reconcile::{set_message_ref, Reconciliation};
use indicatif::ProgressBar;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Message {0} no longer exists")]
    UnknownMessage(String),

    #[error("Listing {0} has no message to update")]
    NoMessage(String),

    #[error("Dispatcher not ready: {0}")]
    NotReady(String),
}

/// A chat channel that can announce listings.
pub trait Dispatcher {
    fn send(&mut self, listing: &Listing) -> Result<MessageRef, DispatchError>;

    /// Mark the listing's existing message as taken down.
    fn update_removed(&mut self, listing: &Listing) -> Result<(), DispatchError>;

    /// Mark the listing's existing message as available again.
    fn update_reactivated(&mut self, listing: &Listing) -> Result<(), DispatchError>;

    fn delete(&mut self, message_ref: &MessageRef) -> Result<(), DispatchError>;

    /// Delete every message; returns how many are gone afterwards.
    fn bulk_delete(&mut self, message_refs: &[MessageRef]) -> usize {
        let mut deleted = 0;
        for message_ref in message_refs {
            match self.delete(message_ref) {
                Ok(()) | Err(DispatchError::UnknownMessage(_)) => deleted += 1,
                Err(e) => warn!(message = %message_ref.message_id, error = %e, "delete failed"),
            }
        }
        deleted
    }
}

/// Keeps at least `spacing` between consecutive calls.
#[derive(Debug)]
pub struct Pacer {
    spacing: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self { spacing, last: None }
    }

    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.spacing {
                std::thread::sleep(self.spacing - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub sent: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: Vec<(ListingKey, String)>,
}

impl DispatchReport {
    fn fail(&mut self, listing: &Listing, error: &DispatchError) {
        warn!(key = %listing.key(), error = %error, "dispatch failed");
        self.failed.push((listing.key(), error.to_string()));
    }
}

/// Announce a reconciliation: new, then reactivated, then removed.
/// References produced along the way are merged into `result.all`.
pub fn dispatch_changes<D: Dispatcher + ?Sized>(
    dispatcher: &mut D,
    result: &mut Reconciliation,
    pacer: &mut Pacer,
    progress: &ProgressBar,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    progress.set_length((result.new.len() + result.reactivated.len() + result.removed.len()) as u64);

    for listing in result.new.clone() {
        pacer.wait();
        match dispatcher.send(&listing) {
            Ok(message_ref) => {
                result.apply_message_ref(&listing.key(), message_ref);
                report.sent += 1;
            }
            Err(e) => report.fail(&listing, &e),
        }
        progress.inc(1);
    }

    for listing in result.reactivated.clone() {
        pacer.wait();
        let outcome = match listing.message_ref {
            Some(_) => match dispatcher.update_reactivated(&listing) {
                Ok(()) => Ok(None),
                Err(DispatchError::UnknownMessage(_)) => {
                    debug!(key = %listing.key(), "old message is gone, sending a new one");
                    pacer.wait();
                    dispatcher.send(&listing).map(Some)
                }
                Err(e) => Err(e),
            },
            None => dispatcher.send(&listing).map(Some),
        };
        match outcome {
            Ok(Some(message_ref)) => {
                result.apply_message_ref(&listing.key(), message_ref);
                report.sent += 1;
            }
            Ok(None) => report.updated += 1,
            Err(e) => report.fail(&listing, &e),
        }
        progress.inc(1);
    }

    for listing in result.removed.clone() {
        if listing.message_ref.is_none() {
            debug!(key = %listing.key(), "removed listing was never announced");
            report.skipped += 1;
            progress.inc(1);
            continue;
        }
        pacer.wait();
        match dispatcher.update_removed(&listing) {
            Ok(()) => report.updated += 1,
            Err(DispatchError::UnknownMessage(_)) => report.skipped += 1,
            Err(e) => report.fail(&listing, &e),
        }
        progress.inc(1);
    }

    progress.finish_and_clear();
    info!(
        sent = report.sent,
        updated = report.updated,
        skipped = report.skipped,
        failed = report.failed.len(),
        "dispatch finished"
    );
    report
}

/// Send active listings that still have no message, e.g. after a failed send
/// in an earlier run. Listings already tried in this pass (new or
/// reactivated) are left for the next run.
pub fn resend_missing<D: Dispatcher + ?Sized>(
    dispatcher: &mut D,
    result: &mut Reconciliation,
    pacer: &mut Pacer,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let attempted: HashSet<ListingKey> = result
        .new
        .iter()
        .chain(result.reactivated.iter())
        .map(Listing::key)
        .collect();
    let pending: Vec<Listing> = result
        .all
        .iter()
        .filter(|listing| listing.active && listing.message_ref.is_none())
        .filter(|listing| !attempted.contains(&listing.key()))
        .cloned()
        .collect();

    for listing in pending {
        pacer.wait();
        match dispatcher.send(&listing) {
            Ok(message_ref) => {
                set_message_ref(&mut result.all, &listing.key(), message_ref);
                report.sent += 1;
            }
            Err(e) => report.fail(&listing, &e),
        }
    }
    if report.sent > 0 || !report.failed.is_empty() {
        info!(sent = report.sent, failed = report.failed.len(), "resent unannounced listings");
    }
    report
}

/// Delete the messages of the selected listings and forget their references.
/// A listing keeps its reference if its message could not be deleted.
/// Returns the number of messages deleted.
pub fn clear_messages<D, F>(dispatcher: &mut D, listings: &mut [Listing], pacer: &mut Pacer, select: F) -> usize
where
    D: Dispatcher + ?Sized,
    F: Fn(&Listing) -> bool,
{
    let mut deleted = 0;
    for listing in listings.iter_mut().filter(|listing| select(listing)) {
        let Some(message_ref) = listing.message_ref.clone() else {
            continue;
        };
        pacer.wait();
        match dispatcher.delete(&message_ref) {
            Ok(()) | Err(DispatchError::UnknownMessage(_)) => {
                listing.message_ref = None;
                deleted += 1;
            }
            Err(e) => warn!(key = %listing.key(), error = %e, "could not delete message"),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Price;
    use crate::reconcile::{reconcile, SourcePass};
    use chrono::NaiveDate;
    use serde_json::Map;
    use std::collections::HashSet;

    /// Records calls; fails `send` for listed keys.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        failing: HashSet<String>,
        gone: HashSet<String>,
        next_id: u32,
    }

    impl Dispatcher for Recorder {
        fn send(&mut self, listing: &Listing) -> Result<MessageRef, DispatchError> {
            self.calls.push(format!("send {}", listing.identity_key));
            if self.failing.contains(&listing.identity_key) {
                return Err(DispatchError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.next_id += 1;
            Ok(MessageRef {
                channel_id: "c".to_string(),
                message_id: format!("m{}", self.next_id),
            })
        }

        fn update_removed(&mut self, listing: &Listing) -> Result<(), DispatchError> {
            self.calls.push(format!("removed {}", listing.identity_key));
            Ok(())
        }

        fn update_reactivated(&mut self, listing: &Listing) -> Result<(), DispatchError> {
            self.calls.push(format!("reactivated {}", listing.identity_key));
            let id = &listing.message_ref.as_ref().unwrap().message_id;
            if self.gone.contains(id) {
                return Err(DispatchError::UnknownMessage(id.clone()));
            }
            Ok(())
        }

        fn delete(&mut self, message_ref: &MessageRef) -> Result<(), DispatchError> {
            self.calls.push(format!("delete {}", message_ref.message_id));
            if self.failing.contains(&message_ref.message_id) {
                return Err(DispatchError::NotReady("offline".to_string()));
            }
            Ok(())
        }
    }

    fn listing(key: &str) -> Listing {
        Listing {
            source_id: "subo".to_string(),
            identity_key: key.to_string(),
            url: format!("https://www.subo.se/{key}"),
            address: key.to_string(),
            price: Price::Unknown,
            rooms: "2 rum".to_string(),
            size: "48 kvm".to_string(),
            available_text: "Ledigt nu".to_string(),
            image_url: None,
            active: true,
            removed_at: None,
            manual_override: false,
            message_ref: None,
            first_seen: None,
            last_seen: None,
            extra: Map::new(),
        }
    }

    fn with_ref(mut listing: Listing, id: &str) -> Listing {
        listing.message_ref = Some(MessageRef {
            channel_id: "c".to_string(),
            message_id: id.to_string(),
        });
        listing
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn pacer() -> Pacer {
        Pacer::new(Duration::ZERO)
    }

    #[test]
    fn order_is_new_reactivated_removed_and_refs_flow_back() {
        let mut gone = listing("R");
        gone.deactivate(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let previous = vec![with_ref(listing("A"), "old-a"), with_ref(gone, "old-r")];
        let mut result = reconcile(
            previous,
            vec![SourcePass::fetched("subo", vec![listing("R"), listing("N")])],
            today(),
        );

        let mut recorder = Recorder::default();
        let report = dispatch_changes(&mut recorder, &mut result, &mut pacer(), &ProgressBar::hidden());

        assert_eq!(recorder.calls, vec!["send N", "reactivated R", "removed A"]);
        assert_eq!(report.sent, 1);
        assert_eq!(report.updated, 2);
        let n = result.all.iter().find(|l| l.identity_key == "N").unwrap();
        assert_eq!(n.message_ref.as_ref().unwrap().message_id, "m1");
        let r = result.all.iter().find(|l| l.identity_key == "R").unwrap();
        assert_eq!(r.message_ref.as_ref().unwrap().message_id, "old-r");
    }

    #[test]
    fn one_failure_does_not_stop_the_batch() {
        let mut result = reconcile(
            Vec::new(),
            vec![SourcePass::fetched("subo", vec![listing("A"), listing("B"), listing("C")])],
            today(),
        );
        let mut recorder = Recorder {
            failing: ["B".to_string()].into_iter().collect(),
            ..Default::default()
        };

        let report = dispatch_changes(&mut recorder, &mut result, &mut pacer(), &ProgressBar::hidden());

        assert_eq!(report.sent, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.identity_key, "B");
        assert!(result.all[1].message_ref.is_none());
        assert!(result.all[0].message_ref.is_some());
        assert!(result.all[2].message_ref.is_some());
    }

    #[test]
    fn reactivated_with_deleted_message_gets_a_new_one() {
        let mut gone = with_ref(listing("R"), "old-r");
        gone.deactivate(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let mut result = reconcile(vec![gone], vec![SourcePass::fetched("subo", vec![listing("R")])], today());
        let mut recorder = Recorder {
            gone: ["old-r".to_string()].into_iter().collect(),
            ..Default::default()
        };

        let report = dispatch_changes(&mut recorder, &mut result, &mut pacer(), &ProgressBar::hidden());

        assert_eq!(recorder.calls, vec!["reactivated R", "send R"]);
        assert_eq!(report.sent, 1);
        assert_eq!(result.all[0].message_ref.as_ref().unwrap().message_id, "m1");
    }

    #[test]
    fn removed_without_message_is_skipped() {
        let mut result = reconcile(vec![listing("A")], vec![SourcePass::fetched("subo", Vec::new())], today());
        let mut recorder = Recorder::default();
        let report = dispatch_changes(&mut recorder, &mut result, &mut pacer(), &ProgressBar::hidden());
        assert!(recorder.calls.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn resend_fills_only_missing_refs_of_active_listings() {
        let mut inactive = listing("C");
        inactive.deactivate(today());
        let mut held = listing("D");
        held.hold(today());
        let mut result = Reconciliation {
            all: vec![with_ref(listing("A"), "x"), listing("B"), inactive, held],
            ..Default::default()
        };
        let mut recorder = Recorder::default();

        let report = resend_missing(&mut recorder, &mut result, &mut pacer());

        assert_eq!(recorder.calls, vec!["send B"]);
        assert_eq!(report.sent, 1);
        assert_eq!(result.all[0].message_ref.as_ref().unwrap().message_id, "x");
        assert_eq!(result.all[1].message_ref.as_ref().unwrap().message_id, "m1");
        assert!(result.all[2].message_ref.is_none());
        assert!(result.all[3].message_ref.is_none());
    }

    #[test]
    fn resend_skips_listings_already_tried_this_pass() {
        let mut result = reconcile(
            vec![listing("Old")],
            vec![SourcePass::fetched("subo", vec![listing("Old"), listing("N")])],
            today(),
        );
        let mut recorder = Recorder {
            failing: ["N".to_string()].into_iter().collect(),
            ..Default::default()
        };

        dispatch_changes(&mut recorder, &mut result, &mut pacer(), &ProgressBar::hidden());
        let report = resend_missing(&mut recorder, &mut result, &mut pacer());

        assert_eq!(recorder.calls, vec!["send N", "send Old"]);
        assert_eq!(report.sent, 1);
        let n = result.all.iter().find(|l| l.identity_key == "N").unwrap();
        assert!(n.message_ref.is_none());
    }

    #[test]
    fn clear_keeps_refs_that_could_not_be_deleted() {
        let mut listings = vec![with_ref(listing("A"), "1"), with_ref(listing("B"), "2"), listing("C")];
        let mut recorder = Recorder {
            failing: ["2".to_string()].into_iter().collect(),
            ..Default::default()
        };

        let deleted = clear_messages(&mut recorder, &mut listings, &mut pacer(), |_| true);

        assert_eq!(deleted, 1);
        assert!(listings[0].message_ref.is_none());
        assert_eq!(listings[1].message_ref.as_ref().unwrap().message_id, "2");
    }

    #[test]
    fn bulk_delete_counts_already_gone_messages() {
        let refs = vec![
            MessageRef {
                channel_id: "c".to_string(),
                message_id: "1".to_string(),
            },
            MessageRef {
                channel_id: "c".to_string(),
                message_id: "2".to_string(),
            },
        ];
        let mut recorder = Recorder {
            failing: ["2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(recorder.bulk_delete(&refs), 1);
    }
}
