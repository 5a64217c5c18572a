//! Testing utilities
//!
//! An in-process broker and recording callbacks for exercising the client
//! without a network or an external MQTT server.

pub mod broker;
pub mod mocks;

pub use broker::MockBroker;
pub use mocks::*;
