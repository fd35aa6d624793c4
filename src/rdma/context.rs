//! Shared RDMA device resources: context, protection domain, completion queue.

use crate::error::{DmalinkError, Result};
use std::ffi::CStr;
use std::os::raw::c_int;
use std::ptr;

/// Completion queue depth. One work request is outstanding at a time, so a
/// small queue is plenty.
const CQ_DEPTH: c_int = 16;

/// The physical port used on the selected device.
pub(super) const PORT_NUM: u8 = 1;

/// An opened RDMA device with its protection domain and a single completion
/// queue shared by send and receive work.
///
/// Owns the ibverbs `Context`, PD, and CQ. Queue pairs and memory
/// registrations are created from this context and hold an `Arc` to it, so
/// the device is closed only after everything derived from it is gone.
pub struct RdmaContext {
    pub(super) ctx: *mut ibverbs_sys::ibv_context,
    pub(super) pd: *mut ibverbs_sys::ibv_pd,
    pub(super) cq: *mut ibverbs_sys::ibv_cq,
    pub(super) lid: u16,
    pub(super) gid: [u8; 16],
    device_name: String,
}

unsafe impl Send for RdmaContext {}
unsafe impl Sync for RdmaContext {}

impl RdmaContext {
    /// Open an RDMA device and allocate shared resources.
    ///
    /// `device_name` selects the device by name; `None` takes the first
    /// device in the list. Queries port 1 attributes and, on Ethernet link
    /// layers, GID index 0 for routed addressing (the GID stays zero on
    /// InfiniBand fabrics, where LID addressing suffices).
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                return Err(DmalinkError::device("no RDMA devices found"));
            }

            let mut dev = ptr::null_mut();
            let mut found_name = String::new();
            for i in 0..num_devices as usize {
                let candidate = *dev_list.add(i);
                let name_ptr = ibverbs_sys::ibv_get_device_name(candidate);
                let name = if name_ptr.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
                };
                match device_name {
                    Some(wanted) if wanted != name => continue,
                    _ => {
                        dev = candidate;
                        found_name = name;
                        break;
                    }
                }
            }

            if dev.is_null() {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(DmalinkError::device(format!(
                    "RDMA device {:?} not found (have {num_devices})",
                    device_name.unwrap_or("<first>")
                )));
            }

            let ctx = ibverbs_sys::ibv_open_device(dev);
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(DmalinkError::device(format!(
                    "ibv_open_device failed for {found_name}"
                )));
            }

            let mut port_attr: ibverbs_sys::ibv_port_attr = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_port(
                ctx,
                PORT_NUM,
                &mut port_attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
            );
            if rc != 0 {
                ibverbs_sys::ibv_close_device(ctx);
                return Err(DmalinkError::device(format!(
                    "ibv_query_port failed (rc={rc})"
                )));
            }

            let mut gid = [0u8; 16];
            if port_attr.link_layer == ibverbs_sys::IBV_LINK_LAYER_ETHERNET as u8 {
                let mut raw_gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
                let rc = ibverbs_sys::ibv_query_gid(ctx, PORT_NUM, 0, &mut raw_gid);
                if rc != 0 {
                    ibverbs_sys::ibv_close_device(ctx);
                    return Err(DmalinkError::device(format!(
                        "ibv_query_gid failed (rc={rc})"
                    )));
                }
                gid = raw_gid.raw;
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                ibverbs_sys::ibv_close_device(ctx);
                return Err(DmalinkError::device("ibv_alloc_pd failed"));
            }

            let cq = ibverbs_sys::ibv_create_cq(ctx, CQ_DEPTH, ptr::null_mut(), ptr::null_mut(), 0);
            if cq.is_null() {
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(DmalinkError::device("ibv_create_cq failed"));
            }

            tracing::info!(
                device = %found_name,
                lid = port_attr.lid,
                "RDMA device opened"
            );

            Ok(Self {
                ctx,
                pd,
                cq,
                lid: port_attr.lid,
                gid,
                device_name: found_name,
            })
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Port LID, zero on Ethernet link layers.
    pub fn lid(&self) -> u16 {
        self.lid
    }

    /// Raw GID bytes, all-zero when local addressing is in use.
    pub fn gid(&self) -> [u8; 16] {
        self.gid
    }
}

impl Drop for RdmaContext {
    fn drop(&mut self) {
        unsafe {
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}
