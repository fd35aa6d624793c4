//! Memory registration: binding the transfer buffer to the transport device.

use super::context::RdmaContext;
use crate::buffer::{BufferHandle, DataAddress};
use crate::error::{DmalinkError, Result};
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::Arc;

fn full_access() -> ibverbs_sys::ibv_access_flags {
    ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ
        | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
        | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC
}

/// The transfer buffer registered with the transport device.
///
/// Borrows the buffer it registers, so the registration can never outlive
/// the memory the NIC was granted access to. Exactly one registration
/// exists per process.
pub struct MemoryRegistration<'buf> {
    mr: *mut ibverbs_sys::ibv_mr,
    addr: DataAddress,
    len: usize,
    _ctx: Arc<RdmaContext>,
    _buffer: PhantomData<&'buf BufferHandle>,
}

unsafe impl Send for MemoryRegistration<'_> {}
unsafe impl Sync for MemoryRegistration<'_> {}

impl RdmaContext {
    /// Register `buffer` with this device, granting local-write and full
    /// remote (read/write/atomic) access.
    ///
    /// When the buffer carries a dmabuf descriptor, registration goes
    /// through `ibv_reg_dmabuf_mr` first; a NIC that rejects the dmabuf
    /// falls back to registering the CPU-visible pointer. Only the failure
    /// of every applicable strategy is an error.
    pub fn register<'buf>(
        self: &Arc<Self>,
        buffer: &'buf BufferHandle,
    ) -> Result<MemoryRegistration<'buf>> {
        let access = full_access();

        unsafe {
            if let (Some(fd), Some(va)) = (buffer.dmabuf_fd(), buffer.device_va()) {
                let mr = ibverbs_sys::ibv_reg_dmabuf_mr(
                    self.pd,
                    0,
                    buffer.size(),
                    va,
                    fd,
                    access.0 as c_int,
                );
                if !mr.is_null() {
                    tracing::info!(fd, "dmabuf registered at {va:#x}");
                    return Ok(MemoryRegistration {
                        mr,
                        addr: DataAddress::Device(va),
                        len: buffer.size(),
                        _ctx: Arc::clone(self),
                        _buffer: PhantomData,
                    });
                }
                tracing::warn!("dmabuf registration failed, trying host registration");
            }

            if let Some(ptr) = buffer.cpu_ptr() {
                let mr =
                    ibverbs_sys::ibv_reg_mr(self.pd, ptr as *mut _, buffer.size(), access.0 as c_int);
                if mr.is_null() {
                    return Err(DmalinkError::registration(format!(
                        "ibv_reg_mr failed for {} bytes",
                        buffer.size()
                    )));
                }
                tracing::info!(size = buffer.size(), "host memory registered");
                return Ok(MemoryRegistration {
                    mr,
                    addr: DataAddress::Host(ptr as u64),
                    len: buffer.size(),
                    _ctx: Arc::clone(self),
                    _buffer: PhantomData,
                });
            }
        }

        Err(DmalinkError::registration(
            "no registrable memory: dmabuf rejected and buffer has no CPU mapping",
        ))
    }
}

impl MemoryRegistration<'_> {
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }

    /// The address work requests should reference, matching whichever
    /// registration strategy succeeded.
    pub fn data_address(&self) -> DataAddress {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MemoryRegistration<'_> {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
        }
    }
}
