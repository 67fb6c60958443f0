pub mod config;
pub mod fetcher;
