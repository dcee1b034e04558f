pub mod config;
pub mod crm;
pub mod dedup;
pub mod error;
pub mod lifecycle;
pub mod payments;
pub mod rate_limit;
pub mod signature;
pub mod store;
pub mod types;
