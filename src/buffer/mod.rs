//! Transfer buffer acquisition.
//!
//! The buffer preferentially lives in accelerator device memory exported as
//! a dmabuf file descriptor (zero-copy path: NIC reads device memory
//! directly). When any step of that path is unavailable the chain degrades:
//!
//! 1. no accelerator at all → page-aligned host memory;
//! 2. device allocation or mapping fails → host memory;
//! 3. dmabuf export fails → host memory, additionally mapped into the
//!    device's address space when possible so the device observes CPU
//!    writes;
//! 4. dmabuf export succeeds → CPU mapping of the fd is attempted but
//!    optional; a device-only buffer (no CPU pointer) is valid.
//!
//! Teardown is `Drop`-driven: the fd is closed first, then the CPU mapping
//! is unmapped, then device resources are released, then host memory is
//! freed.

mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::{HostRegion, HOST_ALIGN};

#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;

use crate::error::{DmalinkError, Result};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Arc;

/// Where the registered data lives, as seen by the network device.
///
/// Posting and registration consume this uniformly instead of branching on
/// a sentinel descriptor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAddress {
    /// Device virtual address of dmabuf-exported accelerator memory.
    Device(u64),
    /// Host virtual address of CPU-accessible memory.
    Host(u64),
}

impl DataAddress {
    pub fn as_u64(self) -> u64 {
        match self {
            DataAddress::Device(va) => va,
            DataAddress::Host(addr) => addr,
        }
    }
}

/// Properties reported by an opened accelerator.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub multiprocessor_count: i32,
    pub dmabuf_capable: bool,
}

/// Device-memory operations the acquisition chain needs from an accelerator.
///
/// Implemented by [`CudaAccelerator`] (feature `cuda`) and by test doubles.
/// Handles and virtual addresses are opaque `u64`s owned by the
/// implementation; the chain only sequences the calls.
pub trait Accelerator: Send + Sync {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Query device properties. An opened device that cannot report them is
    /// broken, which the chain treats as fatal rather than as a fallback.
    fn device_info(&self) -> Result<DeviceInfo>;

    /// Allocate `size` bytes of device memory, returning an opaque handle.
    fn alloc(&self, size: usize) -> Result<u64>;

    /// Release a device allocation.
    fn free(&self, handle: u64);

    /// Map an allocation into the device's virtual address space.
    fn map(&self, handle: u64, size: usize) -> Result<u64>;

    /// Unmap a device virtual address range.
    fn unmap(&self, va: u64, size: usize);

    /// Export a mapped device range as a dmabuf file descriptor.
    fn export_dmabuf(&self, va: u64, size: usize) -> Result<OwnedFd>;

    /// Map host memory into the device's address space so the device can
    /// observe CPU writes. Returns the device-side virtual address.
    fn map_host(&self, ptr: *mut u8, size: usize) -> Result<u64>;

    /// Undo a [`Accelerator::map_host`] mapping.
    fn unmap_host(&self, ptr: *mut u8);
}

/// A CPU mapping of a dmabuf file descriptor.
struct CpuMapping {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for CpuMapping {}
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    fn new(fd: RawFd, len: usize) -> Result<Self> {
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(DmalinkError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self {
            // MAP_FAILED is the only failure sentinel; a successful mmap is non-null.
            ptr: NonNull::new(raw as *mut u8).expect("mmap returned null"),
            len,
        })
    }
}

impl Drop for CpuMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Host-memory-to-device mapping created on the dmabuf-export fallback path.
struct HostDeviceMap {
    va: u64,
    ptr: *mut u8,
}

/// Device-side resources owned by a buffer: the allocation, its device
/// mapping, and (on the export fallback path) the host-to-device mapping.
struct DeviceRegion {
    accel: Arc<dyn Accelerator>,
    handle: u64,
    va: u64,
    size: usize,
    host_map: Option<HostDeviceMap>,
}

impl Drop for DeviceRegion {
    fn drop(&mut self) {
        if let Some(host_map) = self.host_map.take() {
            self.accel.unmap_host(host_map.ptr);
        }
        self.accel.unmap(self.va, self.size);
        self.accel.free(self.handle);
    }
}

/// The single transfer buffer of a link, whatever memory ended up backing it.
///
/// Field order encodes teardown order: the dmabuf descriptor is closed
/// before anything it refers to is unmapped, device resources are released
/// before the device itself (the accelerator handle is dropped with the
/// region), and host memory is freed last.
pub struct BufferHandle {
    size: usize,
    dmabuf: Option<OwnedFd>,
    cpu_map: Option<CpuMapping>,
    device: Option<DeviceRegion>,
    host: Option<HostRegion>,
}

impl BufferHandle {
    /// Acquire a transfer buffer of `size` bytes.
    ///
    /// Walks the device-memory fallback chain; only exhaustion of every
    /// strategy (in practice: host allocation failure) is an error.
    pub fn acquire(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(DmalinkError::allocation("zero-sized transfer buffer"));
        }
        match probe_accelerator() {
            Some(accel) => Self::acquire_on(accel, size),
            None => {
                tracing::info!("no accelerator device found, using host memory");
                Self::host_only(size)
            }
        }
    }

    /// Run the device-memory chain on an already-opened accelerator.
    fn acquire_on(accel: Arc<dyn Accelerator>, size: usize) -> Result<Self> {
        // A device that opened but cannot report its properties is broken,
        // not absent: abort instead of falling back.
        let info = accel.device_info()?;
        tracing::info!(
            device = accel.name(),
            multiprocessors = info.multiprocessor_count,
            dmabuf_capable = info.dmabuf_capable,
            "accelerator opened"
        );

        let handle = match accel.alloc(size) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "device memory allocation failed, using host memory");
                return Self::host_only(size);
            }
        };

        let va = match accel.map(handle, size) {
            Ok(va) => va,
            Err(e) => {
                tracing::warn!(error = %e, "device memory mapping failed, using host memory");
                accel.free(handle);
                return Self::host_only(size);
            }
        };

        match accel.export_dmabuf(va, size) {
            Ok(fd) => {
                tracing::info!(fd = fd.as_raw_fd(), "dmabuf exported for device memory at {va:#x}");
                // CPU visibility into an exported dmabuf is optional; some
                // drivers refuse the mmap and the buffer stays device-only.
                let cpu_map = match CpuMapping::new(fd.as_raw_fd(), size) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        tracing::info!(error = %e, "dmabuf not CPU-mappable, buffer is device-only");
                        None
                    }
                };
                Ok(Self {
                    size,
                    dmabuf: Some(fd),
                    cpu_map,
                    device: Some(DeviceRegion {
                        accel,
                        handle,
                        va,
                        size,
                        host_map: None,
                    }),
                    host: None,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "dmabuf export failed, using host-visible buffer");
                let host = HostRegion::alloc_zeroed(size)?;
                // Give the device a window onto the host buffer when the
                // driver allows it; failure degrades to plain host memory.
                let host_map = match accel.map_host(host.as_ptr(), size) {
                    Ok(host_va) => {
                        tracing::info!("host buffer mapped into device address space at {host_va:#x}");
                        Some(HostDeviceMap {
                            va: host_va,
                            ptr: host.as_ptr(),
                        })
                    }
                    Err(e) => {
                        tracing::info!(error = %e, "host-to-device mapping failed, buffer still usable");
                        None
                    }
                };
                Ok(Self {
                    size,
                    dmabuf: None,
                    cpu_map: None,
                    device: Some(DeviceRegion {
                        accel,
                        handle,
                        va,
                        size,
                        host_map,
                    }),
                    host: Some(host),
                })
            }
        }
    }

    fn host_only(size: usize) -> Result<Self> {
        let host = HostRegion::alloc_zeroed(size)?;
        Ok(Self {
            size,
            dmabuf: None,
            cpu_map: None,
            device: None,
            host: Some(host),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The exported dmabuf descriptor, when the zero-copy path succeeded.
    pub fn dmabuf_fd(&self) -> Option<RawFd> {
        self.dmabuf.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Device virtual address of the data, authoritative only on the dmabuf
    /// export path.
    pub fn device_va(&self) -> Option<u64> {
        if self.dmabuf.is_some() {
            self.device.as_ref().map(|d| d.va)
        } else {
            None
        }
    }

    /// Device-side address of the host buffer on the export-fallback path.
    pub fn host_device_va(&self) -> Option<u64> {
        self.device
            .as_ref()
            .and_then(|d| d.host_map.as_ref())
            .map(|m| m.va)
    }

    /// CPU-visible pointer to the region, if one exists. Device-only
    /// buffers return `None` and every consumer must tolerate that.
    pub fn cpu_ptr(&self) -> Option<*mut u8> {
        self.cpu_map
            .as_ref()
            .map(|m| m.ptr.as_ptr())
            .or_else(|| self.host.as_ref().map(|h| h.as_ptr()))
    }

    /// The address the network device should use for this buffer.
    pub fn data_address(&self) -> DataAddress {
        match self.device_va() {
            Some(va) => DataAddress::Device(va),
            // Every non-dmabuf path carries host memory.
            None => DataAddress::Host(self.cpu_ptr().unwrap_or(std::ptr::null_mut()) as u64),
        }
    }
}

#[cfg(feature = "cuda")]
fn probe_accelerator() -> Option<Arc<dyn Accelerator>> {
    match cuda::CudaAccelerator::open() {
        Ok(accel) => Some(Arc::new(accel)),
        Err(e) => {
            tracing::debug!(error = %e, "accelerator probe failed");
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn probe_accelerator() -> Option<Arc<dyn Accelerator>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Alloc,
        Free,
        Map,
        Unmap,
        Export,
        MapHost,
        UnmapHost,
    }

    #[derive(Clone, Copy)]
    enum ExportFd {
        /// A real (unlinked) file: mmap succeeds.
        Mappable,
        /// A pipe read end: mmap fails with ENODEV.
        Unmappable,
    }

    #[derive(Default)]
    struct FailPlan {
        info: bool,
        alloc: bool,
        map: bool,
        export: bool,
        map_host: bool,
    }

    struct MockAccelerator {
        events: Mutex<Vec<Event>>,
        fail: FailPlan,
        export_fd: ExportFd,
    }

    impl MockAccelerator {
        fn new(fail: FailPlan, export_fd: ExportFd) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                fail,
                export_fd,
            })
        }

        fn record(&self, e: Event) {
            self.events.lock().unwrap().push(e);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    fn unlinked_file_fd(size: usize) -> OwnedFd {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "dmalink-mock-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        file.set_len(size as u64).unwrap();
        std::fs::remove_file(&path).unwrap();
        file.into()
    }

    fn pipe_read_fd() -> OwnedFd {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[1]) };
        unsafe { OwnedFd::from_raw_fd(fds[0]) }
    }

    impl Accelerator for MockAccelerator {
        fn name(&self) -> &str {
            "mock"
        }

        fn device_info(&self) -> Result<DeviceInfo> {
            if self.fail.info {
                return Err(DmalinkError::accelerator("device info query failed"));
            }
            Ok(DeviceInfo {
                multiprocessor_count: 4,
                dmabuf_capable: true,
            })
        }

        fn alloc(&self, _size: usize) -> Result<u64> {
            self.record(Event::Alloc);
            if self.fail.alloc {
                return Err(DmalinkError::device("mock alloc failure"));
            }
            Ok(0x1000)
        }

        fn free(&self, _handle: u64) {
            self.record(Event::Free);
        }

        fn map(&self, _handle: u64, _size: usize) -> Result<u64> {
            self.record(Event::Map);
            if self.fail.map {
                return Err(DmalinkError::device("mock map failure"));
            }
            Ok(0xdead_0000)
        }

        fn unmap(&self, _va: u64, _size: usize) {
            self.record(Event::Unmap);
        }

        fn export_dmabuf(&self, _va: u64, size: usize) -> Result<OwnedFd> {
            self.record(Event::Export);
            if self.fail.export {
                return Err(DmalinkError::device("mock export failure"));
            }
            Ok(match self.export_fd {
                ExportFd::Mappable => unlinked_file_fd(size),
                ExportFd::Unmappable => pipe_read_fd(),
            })
        }

        fn map_host(&self, _ptr: *mut u8, _size: usize) -> Result<u64> {
            self.record(Event::MapHost);
            if self.fail.map_host {
                return Err(DmalinkError::device("mock host map failure"));
            }
            Ok(0xbeef_0000)
        }

        fn unmap_host(&self, _ptr: *mut u8) {
            self.record(Event::UnmapHost);
        }
    }

    #[test]
    fn test_host_only_acquire_reports_size() {
        let buf = BufferHandle::acquire(4096).unwrap();
        assert_eq!(buf.size(), 4096);
        assert!(buf.dmabuf_fd().is_none());
        assert!(buf.device_va().is_none());
        let ptr = buf.cpu_ptr().unwrap();
        assert_eq!(ptr as usize % HOST_ALIGN, 0);
        assert!(matches!(buf.data_address(), DataAddress::Host(_)));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            BufferHandle::acquire(0),
            Err(DmalinkError::Allocation(_))
        ));
    }

    #[test]
    fn test_broken_device_info_is_fatal() {
        let accel = MockAccelerator::new(
            FailPlan {
                info: true,
                ..Default::default()
            },
            ExportFd::Mappable,
        );
        let result = BufferHandle::acquire_on(accel.clone(), 4096);
        assert!(matches!(result, Err(DmalinkError::Accelerator(_))));
        // The chain never reached the allocation step.
        assert!(accel.events().is_empty());
    }

    #[test]
    fn test_alloc_failure_routes_to_host_without_export() {
        let accel = MockAccelerator::new(
            FailPlan {
                alloc: true,
                ..Default::default()
            },
            ExportFd::Mappable,
        );
        let buf = BufferHandle::acquire_on(accel.clone(), 4096).unwrap();
        assert_eq!(accel.events(), vec![Event::Alloc]);
        assert!(buf.dmabuf_fd().is_none());
        assert!(buf.cpu_ptr().is_some());
        drop(buf);
        // Nothing device-side to release.
        assert_eq!(accel.events(), vec![Event::Alloc]);
    }

    #[test]
    fn test_map_failure_frees_allocation_and_routes_to_host() {
        let accel = MockAccelerator::new(
            FailPlan {
                map: true,
                ..Default::default()
            },
            ExportFd::Mappable,
        );
        let buf = BufferHandle::acquire_on(accel.clone(), 4096).unwrap();
        assert_eq!(accel.events(), vec![Event::Alloc, Event::Map, Event::Free]);
        assert!(buf.dmabuf_fd().is_none());
        assert!(matches!(buf.data_address(), DataAddress::Host(_)));
    }

    #[test]
    fn test_export_failure_keeps_device_mapping_and_maps_host() {
        let accel = MockAccelerator::new(
            FailPlan {
                export: true,
                ..Default::default()
            },
            ExportFd::Mappable,
        );
        let buf = BufferHandle::acquire_on(accel.clone(), 4096).unwrap();
        assert_eq!(
            accel.events(),
            vec![Event::Alloc, Event::Map, Event::Export, Event::MapHost]
        );
        assert!(buf.dmabuf_fd().is_none());
        assert!(buf.cpu_ptr().is_some());
        assert_eq!(buf.host_device_va(), Some(0xbeef_0000));
        assert!(matches!(buf.data_address(), DataAddress::Host(_)));
        drop(buf);
        // Host mapping undone before the retained device mapping is released.
        assert_eq!(
            accel.events(),
            vec![
                Event::Alloc,
                Event::Map,
                Event::Export,
                Event::MapHost,
                Event::UnmapHost,
                Event::Unmap,
                Event::Free,
            ]
        );
    }

    #[test]
    fn test_export_failure_with_host_map_failure_still_usable() {
        let accel = MockAccelerator::new(
            FailPlan {
                export: true,
                map_host: true,
                ..Default::default()
            },
            ExportFd::Mappable,
        );
        let buf = BufferHandle::acquire_on(accel.clone(), 4096).unwrap();
        assert!(buf.cpu_ptr().is_some());
        assert!(buf.host_device_va().is_none());
        drop(buf);
        assert_eq!(
            accel.events(),
            vec![
                Event::Alloc,
                Event::Map,
                Event::Export,
                Event::MapHost,
                Event::Unmap,
                Event::Free,
            ]
        );
    }

    #[test]
    fn test_export_success_with_cpu_mapping() {
        let accel = MockAccelerator::new(FailPlan::default(), ExportFd::Mappable);
        let buf = BufferHandle::acquire_on(accel.clone(), 4096).unwrap();
        assert!(buf.dmabuf_fd().is_some());
        assert_eq!(buf.device_va(), Some(0xdead_0000));
        assert!(buf.cpu_ptr().is_some());
        assert_eq!(buf.data_address(), DataAddress::Device(0xdead_0000));
        // CPU writes land in the mapping without touching the mock.
        unsafe { buf.cpu_ptr().unwrap().write(0x5a) };
        drop(buf);
        assert_eq!(
            accel.events(),
            vec![Event::Alloc, Event::Map, Event::Export, Event::Unmap, Event::Free]
        );
    }

    #[test]
    fn test_device_only_buffer_when_cpu_mapping_fails() {
        let accel = MockAccelerator::new(FailPlan::default(), ExportFd::Unmappable);
        let buf = BufferHandle::acquire_on(accel.clone(), 4096).unwrap();
        assert!(buf.dmabuf_fd().is_some());
        assert!(buf.cpu_ptr().is_none());
        assert_eq!(buf.data_address(), DataAddress::Device(0xdead_0000));
    }
}
