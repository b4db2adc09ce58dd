//! In-memory implementations of the bridge's external interfaces.
//!
//! Used by the test suites and by the proxy's standalone mode, where the
//! whole bridge runs in one process without a broker or schema registry.

mod bus;
mod schema_store;
mod server;
mod topic_admin;

pub use bus::InMemoryBus;
pub use schema_store::InMemorySchemaStore;
pub use server::InMemoryProtocolServer;
pub use topic_admin::InMemoryTopicAdmin;
