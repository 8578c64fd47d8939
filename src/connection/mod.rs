//! Connection Module
//!
//! Device sessions and their lifetime within a run.
//!
//! - [`driver`]: Protocol, session and driver traits
//! - [`cache`]: Per-run connection cache with threshold enforcement
//! - [`loopback`]: Built-in driver answering from canned responses

pub mod cache;
pub mod driver;
pub mod loopback;

pub use cache::{ConnectionCache, ConnectionHandle, ConnectionRequest};
pub use driver::{Credentials, DeviceDriver, Protocol, Session};
pub use loopback::LoopbackDriver;
