pub mod config;
pub mod driver;
pub mod fetch;
pub mod ledger;
pub mod partition;
pub mod record;
pub mod store;
pub mod writer;
