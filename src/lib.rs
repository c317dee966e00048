//! Native rust implementation of the D-Bus wire protocol, for both ends of a
//! connection.  Supports TCP and UDS transports, the EXTERNAL,
//! DBUS_COOKIE_SHA1 and ANONYMOUS authentication types, exported objects,
//! signal routing by match rule and typed remote calls.

pub mod address;
pub mod config;
pub mod connection;
pub mod convert;
pub mod demarshal;
pub mod dispatch;
pub mod error;
pub mod marshal;
pub mod match_rule;
pub mod message;
pub mod proxy;
pub mod sasl;
pub mod signature;
pub mod transport;
pub mod types;

pub use crate::connection::{Connection, MessageSender};
pub use crate::error::{Error, Result};
