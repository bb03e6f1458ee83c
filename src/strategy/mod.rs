pub mod types;
pub mod pair_selector;
pub mod market_cache;
pub mod client_hub;
pub mod fallback;
pub mod risk;
pub mod signal_engine;
pub mod execution_backend;
pub mod paper_trading_backend;
pub mod okx_trading_backend;
pub mod rate_limiter;
pub mod orchestrator;
