//! AgentBridge Core: exposes agents reachable over a pub/sub bus as MCP
//! tools and resources, A2A agents and REST endpoints.
//!
//! Agents announce themselves on a compacted registration log. The
//! [`store::RegistrationStore`] materializes that log, the
//! [`coordinator::RegistrationCoordinator`] turns each registration into a
//! [`handler::ProtocolHandler`] listed on its front end, and the
//! [`correlation::RequestResponseHandler`] pairs every request published to
//! an agent's request topic with the reply on its response topic.
//!
//! Transport and front ends are reached through traits ([`bus::MessageBus`],
//! [`topics::TopicAdmin`], [`schema::SchemaStore`],
//! [`handler::ProtocolServer`]); [`memory`] provides in-process
//! implementations of each.

pub mod agent;
pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod protocol;
pub mod registration;
pub mod schema;
pub mod store;
pub mod timeout;
pub mod topics;

pub use error::{BridgeError, Result};
pub use registration::{CapabilityKind, Registration, RegistrationKey};
