use crate::common_scraper::{PlatformScraper, ScrapingOptions};
use crate::models::{Candidate, IdentityKind};
use crate::parser::{self, HeadingKind};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

const LISTING_URL: &str = "https://www.subo.se/lediga-lagenheter/";

/// Sundsvalls Bostäder. Cards carry no stable id, so listings are matched on
/// their street address.
pub struct SuboScraper;

impl PlatformScraper for SuboScraper {
    fn source_id(&self) -> &str {
        "subo"
    }

    fn name(&self) -> &str {
        "Sundsvalls Bostäder"
    }

    fn identity(&self) -> IdentityKind {
        IdentityKind::Address
    }

    fn fetch_candidates(&self, client: &Client, _options: &ScrapingOptions) -> Result<Vec<Candidate>> {
        debug!("Fetching listing page: {}", LISTING_URL);
        let body = client
            .get(LISTING_URL)
            .send()
            .and_then(|response| response.error_for_status())
            .context("Failed to fetch listing page")?
            .text()
            .context("Failed to read response body")?;

        parse_listing_page(&body)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("Failed to parse selector {css:?}: {e:?}"))
}

/// Pull one candidate per listing card out of the page.
pub fn parse_listing_page(body: &str) -> Result<Vec<Candidate>> {
    let document = Html::parse_document(body);
    let card_selector = selector(r#"div.elementor[data-elementor-type="jet-listing-items"]"#)?;
    let link_selector = selector("div.make-column-clickable-elementor")?;
    let heading_selector = selector("h2.elementor-heading-title")?;
    let button_selector = selector("span.elementor-button-text")?;
    let style_selector = selector("style")?;

    let mut candidates = Vec::new();
    for card in document.select(&card_selector) {
        let mut candidate = Candidate {
            url: card
                .select(&link_selector)
                .find_map(|el| el.value().attr("data-column-clickable"))
                .map(str::to_string),
            ..Default::default()
        };

        for heading in card.select(&heading_selector) {
            let text = parser::clean_text(&heading.text().collect::<String>());
            let slot = match parser::classify_heading(&text) {
                Some(HeadingKind::Address) => &mut candidate.address,
                Some(HeadingKind::Price) => &mut candidate.price,
                Some(HeadingKind::Rooms) => &mut candidate.rooms,
                Some(HeadingKind::Size) => &mut candidate.size,
                Some(HeadingKind::Available) => &mut candidate.available_text,
                None => continue,
            };
            if slot.is_none() {
                *slot = Some(text);
            }
        }

        // Some cards show a "Ledig" button instead of an availability heading.
        if candidate.available_text.is_none()
            && card
                .select(&button_selector)
                .any(|el| el.text().collect::<String>().trim() == "Ledig")
        {
            candidate.available_text = Some("Ledig".to_string());
        }

        candidate.image_url = card_image(card, &style_selector);
        candidate.raw = Some(card.html());
        candidates.push(candidate);
    }

    debug!("Found {} listing cards", candidates.len());
    Ok(candidates)
}

/// The card photo is set as a background image in a `<style>` block on the
/// surrounding grid item.
fn card_image(card: ElementRef, style_selector: &Selector) -> Option<String> {
    let grid_item = card
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().classes().any(|class| class == "jet-listing-grid__item"))?;

    grid_item
        .select(style_selector)
        .find_map(|style| parser::extract_background_image(&style.text().collect::<String>()))
}
