//! Domain types and ports

pub mod ports;
pub mod records;

pub use ports::*;
pub use records::*;
