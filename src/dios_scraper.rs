use crate::common_scraper::{polite_delay, PlatformScraper, ScrapingOptions};
use crate::models::{Candidate, IdentityKind};
use crate::parser;
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

const API_URL: &str = "https://www.dios.se/api/bostad";
const BASE_URL: &str = "https://www.dios.se";
const DEFAULT_CITY: &str = "Sundsvall";
/// Shown when the detail page has no move-in date.
const NO_AVAILABILITY: &str = "Kontakta uthyrare";

/// Diös Fastigheter. The JSON API lists every city; each listing's detail
/// page supplies rooms and move-in date. Matched on the listing URL.
pub struct DiosScraper {
    pub city: String,
}

impl Default for DiosScraper {
    fn default() -> Self {
        Self {
            city: DEFAULT_CITY.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiListing {
    #[serde(default)]
    pub city: String,
    pub url: Option<String>,
    #[serde(default)]
    pub name: String,
    pub area_total: Option<Value>,
    pub rent: Option<Value>,
    pub image: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Details {
    pub size: Option<String>,
    pub rooms: Option<String>,
    pub available: Option<String>,
}

impl PlatformScraper for DiosScraper {
    fn source_id(&self) -> &str {
        "dios"
    }

    fn name(&self) -> &str {
        "Diös Fastigheter"
    }

    fn identity(&self) -> IdentityKind {
        IdentityKind::Url
    }

    fn fetch_candidates(&self, client: &Client, options: &ScrapingOptions) -> Result<Vec<Candidate>> {
        debug!("Fetching listing API: {}", API_URL);
        let items: Vec<ApiListing> = client
            .get(API_URL)
            .header("Accept", "application/json")
            .send()
            .and_then(|response| response.error_for_status())
            .context("Failed to fetch listing API")?
            .json()
            .context("Failed to decode listing API response")?;

        let local: Vec<ApiListing> = items
            .into_iter()
            .filter(|item| item.city.eq_ignore_ascii_case(&self.city))
            .collect();
        debug!("{} listings in {}", local.len(), self.city);

        let mut candidates = Vec::with_capacity(local.len());
        for item in &local {
            let details = match item.url.as_deref() {
                Some(path) => {
                    polite_delay(options);
                    fetch_details(client, &absolute_url(path)).unwrap_or_else(|e| {
                        // Rejected later for missing fields, but its url still counts as seen.
                        warn!(url = path, error = %format!("{e:#}"), "detail page failed");
                        Details::default()
                    })
                }
                None => Details::default(),
            };
            candidates.push(to_candidate(item, details));
        }
        Ok(candidates)
    }
}

fn absolute_url(path: &str) -> String {
    if path.starts_with("http") {
        path.to_string()
    } else {
        format!("{}{}", BASE_URL, path)
    }
}

fn value_text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

/// Merge an API item with what its detail page yielded.
pub fn to_candidate(item: &ApiListing, details: Details) -> Candidate {
    Candidate {
        url: item.url.as_deref().map(absolute_url),
        address: parser::extract_dios_address(&item.name),
        price: value_text(&item.rent).map(|rent| format!("{rent}:-/månad")),
        rooms: details.rooms,
        size: details
            .size
            .or_else(|| value_text(&item.area_total).map(|area| format!("{area} KVM"))),
        available_text: details.available.or_else(|| Some(NO_AVAILABILITY.to_string())),
        image_url: item.image.as_deref().map(absolute_url),
        raw: Some(item.name.clone()),
    }
}

fn fetch_details(client: &Client, url: &str) -> Result<Details> {
    debug!("Fetching detail page: {}", url);
    let body = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .context("Failed to fetch detail page")?
        .text()
        .context("Failed to read detail page")?;
    parse_details(&body)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("Failed to parse selector {css:?}: {e:?}"))
}

fn text_of(el: ElementRef) -> String {
    parser::clean_text(&el.text().collect::<String>())
}

/// Fact highlights are `number` + `unit` span pairs; the first is the area,
/// the second the room count.
pub fn parse_details(body: &str) -> Result<Details> {
    let document = Html::parse_document(body);
    let number_selector = selector("span.object-factshighlightnumber")?;
    let title_selector = selector("dt.object-factshighlightdetailtitle")?;

    let highlights: Vec<String> = document
        .select(&number_selector)
        .filter_map(|number| {
            let unit = number
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "span" && el.value().classes().any(|c| c == "object-factshighlightunit"))?;
            Some(format!("{} {}", text_of(number), text_of(unit)))
        })
        .collect();

    let available = document
        .select(&title_selector)
        .find(|title| text_of(*title) == "Tillträde")
        .and_then(|title| {
            title
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "dd")
        })
        .map(text_of)
        .filter(|text| !text.is_empty());

    Ok(Details {
        size: highlights.first().cloned(),
        rooms: highlights.get(1).cloned(),
        available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"
<html><body>
<div class="object-factshighlight">
  <span class="object-factshighlightnumber">54</span> <span class="object-factshighlightunit">kvm</span>
</div>
<div class="object-factshighlight">
  <span class="object-factshighlightnumber">2</span><span class="object-factshighlightunit">rum</span>
</div>
<dl>
  <dt class="object-factshighlightdetailtitle">Hyra</dt><dd class="object-factshighlightdetailvalue">7 100 kr</dd>
  <dt class="object-factshighlightdetailtitle">Tillträde</dt>
  <dd class="object-factshighlightdetailvalue"> 2024-05-01 </dd>
</dl>
</body></html>"#;

    #[test]
    fn detail_page_facts_are_read() {
        let details = parse_details(DETAIL).unwrap();
        assert_eq!(
            details,
            Details {
                size: Some("54 kvm".to_string()),
                rooms: Some("2 rum".to_string()),
                available: Some("2024-05-01".to_string()),
            }
        );
    }

    #[test]
    fn api_items_decode_and_merge() {
        let items: Vec<ApiListing> = serde_json::from_str(
            r#"[
                {"city": "SUNDSVALL", "url": "/bostad/sundsvall/123", "name": "54 kvm på Storgatan 12, Sundsvall",
                 "areaTotal": 54, "rent": 7100, "image": "/media/123.jpg"},
                {"city": "Umeå", "url": "/bostad/umea/9", "name": "Lokal", "rent": "5000"}
            ]"#,
        )
        .unwrap();

        let candidate = to_candidate(&items[0], Details::default());
        assert_eq!(candidate.url.as_deref(), Some("https://www.dios.se/bostad/sundsvall/123"));
        assert_eq!(candidate.address.as_deref(), Some("Storgatan 12"));
        assert_eq!(candidate.price.as_deref(), Some("7100:-/månad"));
        assert_eq!(candidate.size.as_deref(), Some("54 KVM"));
        assert_eq!(candidate.rooms, None);
        assert_eq!(candidate.available_text.as_deref(), Some("Kontakta uthyrare"));
        assert_eq!(candidate.image_url.as_deref(), Some("https://www.dios.se/media/123.jpg"));

        let other = to_candidate(&items[1], parse_details(DETAIL).unwrap());
        assert_eq!(other.address, None);
        assert_eq!(other.rooms.as_deref(), Some("2 rum"));
        assert_eq!(other.size.as_deref(), Some("54 kvm"));
    }
}
