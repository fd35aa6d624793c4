//! Zero-copy point-to-point RDMA link.
//!
//! Establishes exactly one reliable connected queue pair between two hosts
//! and moves a single fixed-size buffer between them with send/receive and
//! one-sided read/write. The buffer preferentially lives in accelerator
//! device memory exported as a dmabuf descriptor, so transfers go
//! device → NIC → network with no CPU copy; every step of that path
//! degrades gracefully to pinned host memory.
//!
//! Setup order is enforced by construction: acquire a [`BufferHandle`],
//! open an [`RdmaContext`], register the buffer, prepare the connection,
//! exchange endpoints over a [`Rendezvous`] socket, then complete the
//! queue pair handshake.

pub mod buffer;
pub mod config;
pub mod error;
pub mod rdma;
pub mod rendezvous;

pub use buffer::{Accelerator, BufferHandle, DataAddress, DeviceInfo};
pub use config::Config;
pub use error::{DmalinkError, Result};
pub use rdma::{
    Completion, Connection, Endpoint, MemoryRegistration, PreparedConnection, QpState,
    RdmaContext, ENDPOINT_WIRE_SIZE,
};
pub use rendezvous::{Rendezvous, RendezvousListener};
