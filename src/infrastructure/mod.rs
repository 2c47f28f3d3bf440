//! Drivers connecting the balancer to database nodes

pub mod driver;
pub mod memory_driver;

pub use driver::{DriverError, NodeDriver, Row, RowSet};
pub use memory_driver::MemoryDriver;
