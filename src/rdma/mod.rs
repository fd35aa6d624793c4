//! RDMA transport: device context, memory registration, and the reliable
//! connected queue pair.

mod connection;
mod context;
mod mr;

pub use connection::{
    Completion, Connection, Endpoint, PreparedConnection, QpState, ENDPOINT_WIRE_SIZE,
};
pub use context::RdmaContext;
pub use mr::MemoryRegistration;
