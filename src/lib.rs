pub mod common_scraper;
pub mod config;
pub mod debug;
pub mod dios_scraper;
pub mod models;
pub mod normalizer;
pub mod notify;
pub mod parser;
pub mod reconcile;
pub mod scrapers;
pub mod store;
pub mod subo_scraper;
pub mod tui;
pub mod utils;
