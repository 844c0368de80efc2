//! tcpguard: Tool Capability Protocol descriptor validation and enforcement.
//!
//! A host calls [`gateway::EnforcementGateway::authorize`] before letting an
//! agent run a command. The gateway looks up the command's binary
//! descriptor, evaluates its risk in context, and answers allow, deny,
//! quarantine or "ask a human". Every answer lands in an append-only audit
//! log.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod descriptor;
pub mod registry;
pub mod risk;

pub mod accelerator;
pub mod engine;
pub mod gateway;

pub mod approval;
pub mod audit;
pub mod quarantine;

pub mod config;
pub mod logging;
