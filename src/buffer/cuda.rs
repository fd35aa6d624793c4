//! CUDA accelerator backend.
//!
//! Device memory is allocated through the driver virtual-memory API
//! (`cuMemCreate` + `cuMemAddressReserve`/`cuMemMap`), which keeps the
//! allocate and map steps separate and makes the mapped range exportable as
//! a dmabuf via `cuMemGetHandleForAddressRange`. Host buffers are made
//! device-visible with `cuMemHostRegister`.

#![cfg(feature = "cuda")]

use super::{Accelerator, DeviceInfo};
use crate::error::{DmalinkError, Result};
use cudarc::driver::{sys, CudaContext};
use std::ffi::c_void;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How many device ordinals to probe before giving up.
const MAX_PROBE_ORDINALS: usize = 8;

pub struct CudaAccelerator {
    ctx: Arc<CudaContext>,
    name: String,
    ordinal: usize,
    /// Allocation granularity, learned on first alloc. All VMM sizes are
    /// rounded up to it.
    granularity: AtomicUsize,
}

fn cu_try(ret: sys::CUresult, what: &'static str) -> Result<()> {
    if ret == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DmalinkError::device(format!("{what} failed: {ret:?}")))
    }
}

impl CudaAccelerator {
    /// Open the first CUDA device that responds, probing ordinals in order.
    pub fn open() -> Result<Self> {
        let mut last_err = None;
        for ordinal in 0..MAX_PROBE_ORDINALS {
            match CudaContext::new(ordinal) {
                Ok(ctx) => {
                    return Ok(Self {
                        ctx,
                        name: format!("cuda:{ordinal}"),
                        ordinal,
                        granularity: AtomicUsize::new(0),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(DmalinkError::device(format!(
            "no CUDA device available (last error: {last_err:?})"
        )))
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| DmalinkError::device(format!("CUDA bind_to_thread failed: {e}")))
    }

    fn alloc_prop(&self) -> sys::CUmemAllocationProp {
        let mut prop: sys::CUmemAllocationProp = unsafe { std::mem::zeroed() };
        prop.type_ = sys::CUmemAllocationType::CU_MEM_ALLOCATION_TYPE_PINNED;
        prop.location.type_ = sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
        prop.location.id = self.ordinal as i32;
        prop
    }

    fn padded(&self, size: usize) -> usize {
        let gran = self.granularity.load(Ordering::Relaxed).max(1);
        size.div_ceil(gran) * gran
    }
}

impl Accelerator for CudaAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        let mp = self
            .ctx
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map_err(|e| {
                DmalinkError::accelerator(format!("device attribute query failed: {e}"))
            })?;
        let dmabuf = self
            .ctx
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_DMA_BUF_SUPPORTED)
            .unwrap_or(0);
        Ok(DeviceInfo {
            multiprocessor_count: mp,
            dmabuf_capable: dmabuf != 0,
        })
    }

    fn alloc(&self, size: usize) -> Result<u64> {
        self.bind()?;
        let prop = self.alloc_prop();
        unsafe {
            let mut gran = 0usize;
            cu_try(
                sys::cuMemGetAllocationGranularity(
                    &mut gran,
                    &prop,
                    sys::CUmemAllocationGranularity_flags::CU_MEM_ALLOC_GRANULARITY_MINIMUM,
                ),
                "cuMemGetAllocationGranularity",
            )?;
            self.granularity.store(gran.max(1), Ordering::Relaxed);

            let mut handle: sys::CUmemGenericAllocationHandle = 0;
            cu_try(
                sys::cuMemCreate(&mut handle, self.padded(size), &prop, 0),
                "cuMemCreate",
            )?;
            Ok(handle)
        }
    }

    fn free(&self, handle: u64) {
        unsafe {
            sys::cuMemRelease(handle);
        }
    }

    fn map(&self, handle: u64, size: usize) -> Result<u64> {
        self.bind()?;
        let padded = self.padded(size);
        unsafe {
            let mut ptr: sys::CUdeviceptr = 0;
            cu_try(
                sys::cuMemAddressReserve(&mut ptr, padded, 0, 0, 0),
                "cuMemAddressReserve",
            )?;
            if let Err(e) = cu_try(sys::cuMemMap(ptr, padded, 0, handle, 0), "cuMemMap") {
                sys::cuMemAddressFree(ptr, padded);
                return Err(e);
            }
            let mut access: sys::CUmemAccessDesc = std::mem::zeroed();
            access.location.type_ = sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
            access.location.id = self.ordinal as i32;
            access.flags = sys::CUmemAccess_flags::CU_MEM_ACCESS_FLAGS_PROT_READWRITE;
            if let Err(e) = cu_try(
                sys::cuMemSetAccess(ptr, padded, &access, 1),
                "cuMemSetAccess",
            ) {
                sys::cuMemUnmap(ptr, padded);
                sys::cuMemAddressFree(ptr, padded);
                return Err(e);
            }
            Ok(ptr)
        }
    }

    fn unmap(&self, va: u64, size: usize) {
        let padded = self.padded(size);
        unsafe {
            sys::cuMemUnmap(va, padded);
            sys::cuMemAddressFree(va, padded);
        }
    }

    fn export_dmabuf(&self, va: u64, size: usize) -> Result<OwnedFd> {
        self.bind()?;
        let mut fd: i32 = -1;
        cu_try(
            unsafe {
                sys::cuMemGetHandleForAddressRange(
                    &mut fd as *mut i32 as *mut c_void,
                    va,
                    self.padded(size),
                    sys::CUmemRangeHandleType::CU_MEM_RANGE_HANDLE_TYPE_DMA_BUF_FD,
                    0,
                )
            },
            "cuMemGetHandleForAddressRange",
        )?;
        if fd < 0 {
            return Err(DmalinkError::device(
                "dmabuf export returned an invalid descriptor",
            ));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn map_host(&self, ptr: *mut u8, size: usize) -> Result<u64> {
        self.bind()?;
        unsafe {
            cu_try(
                sys::cuMemHostRegister_v2(
                    ptr as *mut c_void,
                    size,
                    sys::CU_MEMHOSTREGISTER_DEVICEMAP,
                ),
                "cuMemHostRegister",
            )?;
            let mut dptr: sys::CUdeviceptr = 0;
            if let Err(e) = cu_try(
                sys::cuMemHostGetDevicePointer_v2(&mut dptr, ptr as *mut c_void, 0),
                "cuMemHostGetDevicePointer",
            ) {
                sys::cuMemHostUnregister(ptr as *mut c_void);
                return Err(e);
            }
            Ok(dptr)
        }
    }

    fn unmap_host(&self, ptr: *mut u8) {
        unsafe {
            sys::cuMemHostUnregister(ptr as *mut c_void);
        }
    }
}
