pub mod config_store;
pub mod download_cache;
pub mod http_fetcher;
