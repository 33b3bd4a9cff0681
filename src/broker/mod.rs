//! Volume Broker
//!
//! The lifecycle controller, the parsing of its request parameters and the
//! cluster gateway it drives.

pub mod controller;
pub mod gateway;
pub mod request;

pub use controller::{Broker, BrokerConfig};
pub use gateway::KubeGateway;
pub use request::{AccessMode, BindParameters, VolumeRequest};
