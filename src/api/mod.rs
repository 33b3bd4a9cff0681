//! API Module
//!
//! Open Service Broker v2 REST surface and the server that hosts it.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
