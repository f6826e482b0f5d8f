#![forbid(unsafe_code)]
//! Factory crate tying the five protocol adapters together behind one
//! `AnyAgentAdapter` type.
//!
//! Callers pick an [`AgentProtocol`], hand [`build_adapter`] a
//! [`gateway_core::GatewayConfig`], and get back an [`AnyAgentAdapter`] that
//! implements [`gateway_core::AgentAdapter`] the same way any single
//! protocol's adapter does. [`Session::spawn`] additionally owns the
//! subprocess side of the collaborator shims for callers that don't want to
//! wire `tokio::process` themselves.

mod adapter;
mod protocol;
mod session;

pub use adapter::{build_adapter, AnyAgentAdapter};
pub use protocol::AgentProtocol;
pub use session::Session;
