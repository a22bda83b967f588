use crate::models::Listing;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::fs::File;
use std::path::Path;

const COMPANY_MAPPINGS: &[(&str, &str)] = &[
    ("subo.se", "Sundsvalls Bostäder"),
    ("dios.se", "Diös Fastigheter"),
];

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Landlord name for a listing URL, looked up by domain.
pub fn company_name(url: &str) -> &'static str {
    let host = reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_lowercase()));
    let Some(host) = host else {
        return "Unknown Company";
    };
    let domain = host.strip_prefix("www.").unwrap_or(&host);

    COMPANY_MAPPINGS
        .iter()
        .find(|(known, _)| *known == domain)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown Company")
}

pub fn notification_title(url: &str, date: NaiveDate) -> String {
    format!("🏠 {} [{}]", company_name(url), date.format("%Y-%m-%d"))
}

/// Write the snapshot as a flat CSV table, one row per listing.
pub fn export_listings_to_csv(listings: &[Listing], output_path: &Path) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;
    let mut writer = csv::Writer::from_writer(file);

    writer.write_record([
        "Source",
        "Key",
        "URL",
        "Address",
        "Price",
        "Rooms",
        "Size",
        "Available",
        "Active",
        "Removed",
        "First seen",
        "Message",
    ])?;

    let date = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
    for listing in listings {
        writer.write_record([
            listing.source_id.as_str(),
            listing.identity_key.as_str(),
            listing.url.as_str(),
            listing.address.as_str(),
            listing.price.as_str(),
            listing.rooms.as_str(),
            listing.size.as_str(),
            listing.available_text.as_str(),
            if listing.active { "yes" } else { "no" },
            date(listing.removed_at).as_str(),
            date(listing.first_seen).as_str(),
            listing
                .message_ref
                .as_ref()
                .map(|m| m.message_id.as_str())
                .unwrap_or(""),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Price;
    use serde_json::Map;

    #[test]
    fn company_is_found_by_domain() {
        assert_eq!(company_name("https://www.subo.se/lediga-lagenheter/"), "Sundsvalls Bostäder");
        assert_eq!(company_name("https://DIOS.se/bostad/1"), "Diös Fastigheter");
        assert_eq!(company_name("https://example.com/"), "Unknown Company");
        assert_eq!(company_name("not a url"), "Unknown Company");
    }

    #[test]
    fn title_has_company_and_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            notification_title("https://www.subo.se/x", date),
            "🏠 Sundsvalls Bostäder [2024-03-01]"
        );
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.csv");
        let listing = Listing {
            source_id: "dios".to_string(),
            identity_key: "https://www.dios.se/bostad/1".to_string(),
            url: "https://www.dios.se/bostad/1".to_string(),
            address: "Storgatan 12".to_string(),
            price: Price::Unknown,
            rooms: "2 rum".to_string(),
            size: "54 kvm".to_string(),
            available_text: "Kontakta uthyrare".to_string(),
            image_url: None,
            active: false,
            removed_at: NaiveDate::from_ymd_opt(2024, 2, 2),
            manual_override: false,
            message_ref: None,
            first_seen: None,
            last_seen: None,
            extra: Map::new(),
        };

        export_listings_to_csv(&[listing], &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "dios");
        assert_eq!(&rows[0][4], "N/A");
        assert_eq!(&rows[0][8], "no");
        assert_eq!(&rows[0][9], "2024-02-02");
    }
}
