use regex::Regex;
use std::sync::OnceLock;

fn background_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"background-image:\s*url\(["']?([^"')]+)["']?\)"#).expect("valid background-image regex")
    })
}

fn dios_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*kvm\s+på\s+([^,]+)").expect("valid address regex"))
}

/// What a heading on a listing card most likely holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadingKind {
    Address,
    Price,
    Rooms,
    Size,
    Available,
}

/// Guess the field a card heading describes. Order matters: an address
/// contains a comma, a rent ends in `:-/månad`.
pub fn classify_heading(text: &str) -> Option<HeadingKind> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.contains(":-/månad") {
        Some(HeadingKind::Price)
    } else if text.contains("Ledig") {
        Some(HeadingKind::Available)
    } else if text.contains(',') {
        Some(HeadingKind::Address)
    } else if text.contains("rum") && text.chars().any(|c| c.is_ascii_digit()) {
        Some(HeadingKind::Rooms)
    } else if text.to_lowercase().contains("kvm") {
        Some(HeadingKind::Size)
    } else {
        None
    }
}

/// First `background-image: url(..)` found in an inline style block.
pub fn extract_background_image(style: &str) -> Option<String> {
    background_image_re()
        .captures(style)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Street address out of a title such as `"54 kvm på Storgatan 12, Sundsvall"`.
pub fn extract_dios_address(title: &str) -> Option<String> {
    dios_address_re()
        .captures(title)
        .and_then(|captures| captures.get(2))
        .map(|m| m.as_str().trim().to_string())
        .filter(|address| !address.is_empty())
}

/// Collapse runs of whitespace, including the non-breaking spaces the sites use.
pub fn clean_text(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
