pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod pricing;
pub mod proxy;
pub mod store;

pub use error::{RelayError, RelayResult};
pub use models::account::{Account, AccountSelection, AccountStatus, ProxyDescriptor};
pub use models::config::RelayConfig;
pub use models::usage::{CacheCreation, UsageRecord};
pub use pricing::PricingTable;
pub use proxy::orchestrator::{RelayContext, RelayOptions, RelayResponse};
pub use store::{KvStore, MemoryKv};
