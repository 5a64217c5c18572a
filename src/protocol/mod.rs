//! MQTT protocol model: control packets, application messages and topics
//!
//! This module holds the value types shared by the engine, the transports and
//! the test broker. It performs no I/O.

pub mod message;
pub mod packet;
pub mod topics;

pub use message::*;
pub use packet::*;
pub use topics::*;
