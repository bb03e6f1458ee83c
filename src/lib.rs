use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;

pub mod config;
pub mod error;
pub mod exchange_parser;
pub mod strategy;
pub mod utils;

// External collaborators
pub mod coingecko;
pub mod okx;
pub mod prediction;

pub mod feed;
pub mod server;
