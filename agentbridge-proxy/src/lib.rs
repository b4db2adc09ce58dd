//! AgentBridge process: admin server, control API and REST front end on top
//! of `agentbridge-core`.

pub mod admin;
pub mod control;
pub mod error;
pub mod rest;
pub mod standalone;
