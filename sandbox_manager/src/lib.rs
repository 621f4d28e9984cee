mod utils;

pub mod app;
pub mod cli;
pub mod fabric;
pub mod host;
pub mod managers;
pub mod storage;
pub mod ui;
pub mod virtualization;
