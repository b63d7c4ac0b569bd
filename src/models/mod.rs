pub mod account;
pub mod config;
pub mod usage;

pub use account::{Account, AccountSelection, AccountStatus, ProxyDescriptor};
pub use config::RelayConfig;
pub use usage::{CacheCreation, UsageRecord};
