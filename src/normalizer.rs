use crate::models::{Candidate, IdentityKind, Listing, Price};
use chrono::NaiveDate;
use serde_json::Map;
use thiserror::Error;

/// A candidate that cannot become a `Listing`. Not fatal for the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("incomplete listing, missing: {}", missing.join(", "))]
pub struct Rejection {
    pub missing: Vec<&'static str>,
}

fn present(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// The identity key a candidate would get, if the field it is matched on is
/// present. Used to keep incomplete cards from looking removed.
pub fn identity_key(candidate: &Candidate, identity: IdentityKind) -> Option<String> {
    let url = present(&candidate.url).unwrap_or_default();
    let address = present(&candidate.address).unwrap_or_default();
    let key = identity.key_of(&url, &address);
    (!key.is_empty()).then_some(key)
}

/// Turn a candidate into a canonical active listing for `source_id`.
///
/// Every field except `price` is required; a missing price becomes
/// [`Price::Unknown`].
pub fn normalize(
    candidate: &Candidate,
    source_id: &str,
    identity: IdentityKind,
    today: NaiveDate,
) -> Result<Listing, Rejection> {
    let url = present(&candidate.url);
    let address = present(&candidate.address);
    let rooms = present(&candidate.rooms);
    let size = present(&candidate.size);
    let available_text = present(&candidate.available_text);

    let mut missing = Vec::new();
    if url.is_none() {
        missing.push("url");
    }
    if address.is_none() {
        missing.push("address");
    }
    if rooms.is_none() {
        missing.push("rooms");
    }
    if size.is_none() {
        missing.push("size");
    }
    if available_text.is_none() {
        missing.push("available_text");
    }

    let (Some(url), Some(address), Some(rooms), Some(size), Some(available_text)) =
        (url, address, rooms, size, available_text)
    else {
        return Err(Rejection { missing });
    };

    let price = match present(&candidate.price) {
        Some(text) => Price::Known(text),
        None => Price::Unknown,
    };

    Ok(Listing {
        source_id: source_id.to_string(),
        identity_key: identity.key_of(&url, &address),
        url,
        address,
        price,
        rooms,
        size,
        available_text,
        image_url: present(&candidate.image_url),
        active: true,
        removed_at: None,
        manual_override: false,
        message_ref: None,
        first_seen: Some(today),
        last_seen: Some(today),
        extra: Map::new(),
    })
}
