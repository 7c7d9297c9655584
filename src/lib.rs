//! Egress enforcement for a hardened browser shell.
//!
//! Every outbound connection from every process kind goes through the
//! [`ConnectionBroker`], which consults the [`PolicyEngine`] for the
//! container's egress mode and either returns a [`TransportHandle`] or a
//! structured refusal. Tor circuits, encrypted DNS and proxy routing sit
//! behind the broker; the [`LeakHarness`](leak::LeakHarness) verifies from
//! the outside that nothing bypassed it.

pub mod broker;
pub mod config;
pub mod dns;
pub mod dns_resolver;
pub mod error;
pub mod leak;
pub mod logging;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod proxy;
pub mod real_transport;
pub mod relay_transport;
pub mod request;
pub mod system;
pub mod tls_wrapper;
pub mod tor;

#[cfg(test)]
mod test_support;

pub use broker::{ConnectionBroker, ProcessPolicy, Route, StaticProcessPolicy, TransportHandle};
pub use config::EgressConfig;
pub use error::{EgressError, EgressResult};
pub use policy::{ContainerPolicy, ContainerTemplate, EgressMode, PolicyEngine};
pub use request::{ConnectionRequest, ContainerId, ProcessKind, ProfileId, Protocol};
pub use system::{EgressSystem, SystemError};
