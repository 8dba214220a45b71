pub mod cache;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod features;
pub mod indicators;
pub mod processor;
pub mod upstream;
pub mod utils;
