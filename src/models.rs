use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Text stored for a listing whose rent could not be read from the source.
pub const UNKNOWN_PRICE: &str = "N/A";

/// Which field a source uses to recognise the same apartment across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Address,
    Url,
}

impl IdentityKind {
    pub fn key_of(self, url: &str, address: &str) -> String {
        match self {
            IdentityKind::Address => address.trim().to_string(),
            IdentityKind::Url => url.trim().trim_end_matches('/').to_string(),
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::Address => write!(f, "address"),
            IdentityKind::Url => write!(f, "url"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Price {
    Known(String),
    Unknown,
}

impl Price {
    pub fn as_str(&self) -> &str {
        match self {
            Price::Known(text) => text,
            Price::Unknown => UNKNOWN_PRICE,
        }
    }
}

impl Default for Price {
    fn default() -> Self {
        Price::Unknown
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Stored as a plain string so snapshots stay readable; the sentinel maps back to `Unknown`.
impl Serialize for Price {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(match raw {
            Some(text) if !text.trim().is_empty() && text.trim() != UNKNOWN_PRICE => {
                Price::Known(text)
            }
            _ => Price::Unknown,
        })
    }
}

/// Handle to a chat message that announced a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// One rental unit observed at one source.
///
/// Built only by the normalizer (or read back from a snapshot). Fields the
/// current version does not know about are kept in `extra` and written back
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source_id: String,
    pub identity_key: String,
    pub url: String,
    pub address: String,
    #[serde(default)]
    pub price: Price,
    pub rooms: String,
    pub size: String,
    pub available_text: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub removed_at: Option<NaiveDate>,
    /// Set when an operator took the listing down; scrapes must not revive it.
    #[serde(default, skip_serializing_if = "is_false")]
    pub manual_override: bool,
    #[serde(default)]
    pub message_ref: Option<MessageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<NaiveDate>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            source_id: self.source_id.clone(),
            identity_key: self.identity_key.clone(),
        }
    }

    /// Copy the fields a source may change while the listing stays up.
    pub fn refresh_from(&mut self, scraped: &Listing, today: NaiveDate) {
        self.price = scraped.price.clone();
        self.rooms = scraped.rooms.clone();
        self.size = scraped.size.clone();
        self.available_text = scraped.available_text.clone();
        self.image_url = scraped.image_url.clone();
        self.last_seen = Some(today);
    }

    pub fn deactivate(&mut self, today: NaiveDate) {
        self.active = false;
        self.removed_at = Some(today);
    }

    /// Bring a system-deactivated listing back with the freshly scraped fields.
    pub fn reactivate_from(&mut self, scraped: &Listing, today: NaiveDate) {
        self.url = scraped.url.clone();
        self.address = scraped.address.clone();
        self.refresh_from(scraped, today);
        self.active = true;
        self.removed_at = None;
    }

    /// Operator take-down. Keeps an earlier removal date if there is one.
    pub fn hold(&mut self, today: NaiveDate) {
        self.active = false;
        self.manual_override = true;
        self.removed_at.get_or_insert(today);
    }

    /// Lift an operator take-down; the next scrape that sees the listing revives it.
    pub fn release_hold(&mut self) {
        self.manual_override = false;
    }

    pub fn identity_matches(&self, kind: IdentityKind) -> bool {
        self.identity_key == kind.key_of(&self.url, &self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListingKey {
    pub source_id: String,
    pub identity_key: String,
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.identity_key)
    }
}

/// Unvalidated field guesses pulled out of a source page.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Candidate {
    pub url: Option<String>,
    pub address: Option<String>,
    pub price: Option<String>,
    pub rooms: Option<String>,
    pub size: Option<String>,
    pub available_text: Option<String>,
    pub image_url: Option<String>,
    /// Source fragment the fields came from, kept for diagnosing rejects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}
