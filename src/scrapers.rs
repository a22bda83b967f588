use crate::common_scraper::PlatformScraper;
use crate::dios_scraper::DiosScraper;
use crate::subo_scraper::SuboScraper;
use tracing::warn;

/// Every known source, in the order they are scraped.
pub fn all_scrapers() -> Vec<Box<dyn PlatformScraper>> {
    vec![Box::new(SuboScraper), Box::new(DiosScraper::default())]
}

/// The scrapers named in `ids`, or all of them when `ids` is empty.
/// Unknown ids are reported and skipped.
pub fn select_scrapers(ids: &[String]) -> Vec<Box<dyn PlatformScraper>> {
    if ids.is_empty() {
        return all_scrapers();
    }
    for id in ids {
        if !all_scrapers().iter().any(|s| s.source_id() == id) {
            warn!(source = %id, "unknown source, ignoring");
        }
    }
    all_scrapers()
        .into_iter()
        .filter(|s| ids.iter().any(|id| id == s.source_id()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(scrapers: &[Box<dyn PlatformScraper>]) -> Vec<String> {
        scrapers.iter().map(|s| s.source_id().to_string()).collect()
    }

    #[test]
    fn empty_selection_means_all() {
        assert_eq!(ids(&select_scrapers(&[])), vec!["subo", "dios"]);
    }

    #[test]
    fn selection_filters_and_ignores_unknown() {
        let selected = select_scrapers(&["dios".to_string(), "nowhere".to_string()]);
        assert_eq!(ids(&selected), vec!["dios"]);
    }
}
