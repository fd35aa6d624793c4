//! Reliable connected queue pair: bring-up state machine and work posting.
//!
//! Two-phase construction, so a queue pair cannot be used before it is
//! ready to send:
//!
//! 1. `RdmaContext::prepare_connection()` creates the QP and advances
//!    RESET → INIT. Yields the local [`Endpoint`] to hand to the peer.
//! 2. Exchange endpoints out-of-band (see [`crate::rendezvous`]).
//! 3. `PreparedConnection::complete()` runs INIT → RTR → RTS with the
//!    remote endpoint. Only the resulting [`Connection`] can post work.

use super::context::{RdmaContext, PORT_NUM};
use super::mr::MemoryRegistration;
use crate::config;
use crate::error::{DmalinkError, Result};
use ibverbs_sys::{ibv_qp_attr_mask, ibv_qp_state, ibv_send_flags, ibv_wr_opcode};
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

/// Serialized size of an [`Endpoint`]:
/// addr(8) + rkey(4) + qp_num(4) + lid(2) + gid(16).
pub const ENDPOINT_WIRE_SIZE: usize = 34;

/// Connection data exchanged between peers to complete the QP handshake.
///
/// Multi-byte fields travel in network byte order; the GID is carried as
/// raw bytes. Immutable once received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Address of the peer's registered buffer (device VA or host pointer).
    pub addr: u64,
    /// Remote access key for one-sided operations against that buffer.
    pub rkey: u32,
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
}

impl Endpoint {
    pub fn to_bytes(&self) -> [u8; ENDPOINT_WIRE_SIZE] {
        let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.addr.to_be_bytes());
        buf[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        buf[12..16].copy_from_slice(&self.qp_num.to_be_bytes());
        buf[16..18].copy_from_slice(&self.lid.to_be_bytes());
        buf[18..34].copy_from_slice(&self.gid);
        buf
    }

    pub fn from_bytes(buf: &[u8; ENDPOINT_WIRE_SIZE]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[18..34]);
        Self {
            addr: u64::from_be_bytes(buf[0..8].try_into().expect("8-byte slice")),
            rkey: u32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice")),
            qp_num: u32::from_be_bytes(buf[12..16].try_into().expect("4-byte slice")),
            lid: u16::from_be_bytes(buf[16..18].try_into().expect("2-byte slice")),
            gid,
        }
    }

    /// A non-zero GID selects global (routed) addressing.
    pub fn is_global(&self) -> bool {
        self.gid != [0u8; 16]
    }
}

/// Queue pair states, in bring-up order. Transitions are monotonic and
/// one-directional; nothing may be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

impl QpState {
    pub fn as_str(self) -> &'static str {
        match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::ReadyToReceive => "READY_TO_RECEIVE",
            QpState::ReadyToSend => "READY_TO_SEND",
        }
    }

    /// Whether `next` is the single legal successor of `self`.
    pub fn can_advance_to(self, next: QpState) -> bool {
        matches!(
            (self, next),
            (QpState::Reset, QpState::Init)
                | (QpState::Init, QpState::ReadyToReceive)
                | (QpState::ReadyToReceive, QpState::ReadyToSend)
        )
    }
}

/// A successfully polled work completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: u64,
}

impl RdmaContext {
    /// Create the queue pair, advance it to INIT, and assemble the local
    /// endpoint from the registration's address and remote key.
    pub fn prepare_connection(
        self: &Arc<Self>,
        registration: &MemoryRegistration<'_>,
    ) -> Result<PreparedConnection> {
        unsafe {
            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init_attr.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init_attr.send_cq = self.cq;
            init_attr.recv_cq = self.cq;
            init_attr.cap.max_send_wr = 1;
            init_attr.cap.max_recv_wr = 1;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;
            // One request at a time, every send signaled.
            init_attr.sq_sig_all = 1;

            let qp = ibverbs_sys::ibv_create_qp(self.pd, &mut init_attr);
            if qp.is_null() {
                return Err(DmalinkError::device("ibv_create_qp failed"));
            }

            let mut prepared = PreparedConnection {
                qp,
                state: QpState::Reset,
                local: Endpoint {
                    addr: registration.data_address().as_u64(),
                    rkey: registration.rkey(),
                    qp_num: (*qp).qp_num,
                    lid: self.lid,
                    gid: self.gid,
                },
                ctx: Arc::clone(self),
            };
            prepared.advance_to_init()?;
            Ok(prepared)
        }
    }
}

/// A queue pair in INIT, waiting for the peer's endpoint.
pub struct PreparedConnection {
    qp: *mut ibverbs_sys::ibv_qp,
    state: QpState,
    local: Endpoint,
    ctx: Arc<RdmaContext>,
}

unsafe impl Send for PreparedConnection {}
unsafe impl Sync for PreparedConnection {}

impl PreparedConnection {
    /// The local endpoint to hand to the remote peer.
    pub fn endpoint(&self) -> Endpoint {
        self.local
    }

    fn check_advance(&self, next: QpState) -> Result<()> {
        if self.state.can_advance_to(next) {
            Ok(())
        } else {
            Err(DmalinkError::QpTransition {
                state: next.as_str(),
                rc: -1,
            })
        }
    }

    fn advance_to_init(&mut self) -> Result<()> {
        self.check_advance(QpState::Init)?;
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = PORT_NUM;
            attr.qp_access_flags = (ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ
                | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
                .0;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(DmalinkError::QpTransition {
                    state: QpState::Init.as_str(),
                    rc,
                });
            }
        }
        self.state = QpState::Init;
        Ok(())
    }

    /// Complete the handshake with the remote peer's endpoint:
    /// INIT → RTR → RTS. Failure at either step is fatal and releases the
    /// queue pair.
    pub fn complete(mut self, remote: &Endpoint) -> Result<Connection> {
        self.advance_to_rtr(remote)?;
        self.advance_to_rts()?;

        let qp = self.qp;
        self.qp = ptr::null_mut();
        Ok(Connection {
            qp,
            cq: self.ctx.cq,
            remote: *remote,
            ctx: Arc::clone(&self.ctx),
        })
    }

    fn advance_to_rtr(&mut self, remote: &Endpoint) -> Result<()> {
        self.check_advance(QpState::ReadyToReceive)?;
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_4096;
            attr.dest_qp_num = remote.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 1;
            attr.min_rnr_timer = 12;

            attr.ah_attr.is_global = 0;
            attr.ah_attr.dlid = remote.lid;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = PORT_NUM;

            if remote.is_global() {
                attr.ah_attr.is_global = 1;
                attr.ah_attr.grh.dgid.raw = remote.gid;
                attr.ah_attr.grh.sgid_index = 0;
                attr.ah_attr.grh.hop_limit = 1;
            }

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(DmalinkError::QpTransition {
                    state: QpState::ReadyToReceive.as_str(),
                    rc,
                });
            }
        }
        self.state = QpState::ReadyToReceive;
        Ok(())
    }

    fn advance_to_rts(&mut self) -> Result<()> {
        self.check_advance(QpState::ReadyToSend)?;
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 1;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(DmalinkError::QpTransition {
                    state: QpState::ReadyToSend.as_str(),
                    rc,
                });
            }
        }
        self.state = QpState::ReadyToSend;
        Ok(())
    }
}

impl Drop for PreparedConnection {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
                self.qp = ptr::null_mut();
            }
        }
    }
}

/// A fully connected RC queue pair, ready to post work.
pub struct Connection {
    qp: *mut ibverbs_sys::ibv_qp,
    cq: *mut ibverbs_sys::ibv_cq,
    remote: Endpoint,
    ctx: Arc<RdmaContext>,
}

unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Post a two-sided send of the whole registered region.
    pub fn post_send(&self, mr: &MemoryRegistration<'_>) -> Result<()> {
        self.post(mr, ibv_wr_opcode::IBV_WR_SEND)
    }

    /// Post a one-sided write of the whole region into the peer's buffer.
    pub fn rdma_write(&self, mr: &MemoryRegistration<'_>) -> Result<()> {
        self.post(mr, ibv_wr_opcode::IBV_WR_RDMA_WRITE)
    }

    /// Post a one-sided read of the peer's buffer into the whole region.
    pub fn rdma_read(&self, mr: &MemoryRegistration<'_>) -> Result<()> {
        self.post(mr, ibv_wr_opcode::IBV_WR_RDMA_READ)
    }

    fn post(&self, mr: &MemoryRegistration<'_>, opcode: ibv_wr_opcode::Type) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = mr.data_address().as_u64();
            sge.length = mr.len() as u32;
            sge.lkey = mr.lkey();

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = 0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = opcode;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

            if opcode != ibv_wr_opcode::IBV_WR_SEND {
                wr.wr.rdma.remote_addr = self.remote.addr;
                wr.wr.rdma.rkey = self.remote.rkey;
            }

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 {
                return Err(DmalinkError::device(format!("post_send failed (rc={rc})")));
            }
        }
        Ok(())
    }

    /// Post a receive spanning the whole registered region.
    pub fn post_recv(&self, mr: &MemoryRegistration<'_>) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = mr.data_address().as_u64();
            sge.length = mr.len() as u32;
            sge.lkey = mr.lkey();

            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = 0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_recv.as_mut().expect("post_recv missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 {
                return Err(DmalinkError::device(format!("post_recv failed (rc={rc})")));
            }
        }
        Ok(())
    }

    /// Block until the completion of the previously posted work request.
    ///
    /// Exactly one post must precede each call; outstanding requests are
    /// never polled concurrently.
    pub fn poll_completion(&self) -> Result<Completion> {
        poll_loop(config::POLL_ATTEMPTS, config::POLL_INTERVAL, || {
            self.poll_once()
        })
    }

    fn poll_once(&self) -> Result<Option<Completion>> {
        unsafe {
            let mut wc = ibverbs_sys::ibv_wc::default();
            let ctx = (*self.cq).context;
            let ops = &mut (*ctx).ops;
            let n = ops.poll_cq.as_mut().expect("poll_cq missing")(self.cq, 1, &mut wc as *mut _);
            if n < 0 {
                return Err(DmalinkError::Poll);
            }
            if n == 0 {
                return Ok(None);
            }
            if let Some((status, vendor_err)) = wc.error() {
                return Err(DmalinkError::CompletionStatus {
                    status: format!(
                        "{status:?} (vendor_err={vendor_err}, wr_id={})",
                        wc.wr_id()
                    ),
                });
            }
            Ok(Some(Completion { wr_id: wc.wr_id() }))
        }
    }
}

impl Drop for Connection {
    // The held `ctx` keeps the CQ and PD alive until the QP is destroyed.
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
        }
    }
}

/// Poll `poll_one` until it yields an entry, up to `attempts` tries with
/// `interval` of sleep between empty polls.
pub(crate) fn poll_loop<F>(attempts: u32, interval: Duration, mut poll_one: F) -> Result<Completion>
where
    F: FnMut() -> Result<Option<Completion>>,
{
    for _ in 0..attempts {
        if let Some(completion) = poll_one()? {
            return Ok(completion);
        }
        std::thread::sleep(interval);
    }
    Err(DmalinkError::PollTimeout { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_roundtrip() {
        let ep = Endpoint {
            addr: 0x1000,
            rkey: 0xAABBCCDD,
            qp_num: 7,
            lid: 3,
            gid: [0u8; 16],
        };
        let bytes = ep.to_bytes();
        assert_eq!(Endpoint::from_bytes(&bytes), ep);
    }

    #[test]
    fn test_endpoint_wire_layout() {
        let ep = Endpoint {
            addr: 0x0102030405060708,
            rkey: 0x0A0B0C0D,
            qp_num: 0x11223344,
            lid: 0xBEEF,
            gid: [9u8; 16],
        };
        let bytes = ep.to_bytes();
        // Network byte order at the documented offsets.
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[12..16], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&bytes[16..18], &[0xBE, 0xEF]);
        assert_eq!(&bytes[18..34], &[9u8; 16]);
    }

    #[test]
    fn test_endpoint_roundtrip_with_gid() {
        let ep = Endpoint {
            addr: u64::MAX,
            rkey: 1,
            qp_num: u32::MAX,
            lid: 0,
            gid: [
                0xFE, 0x80, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8,
            ],
        };
        let decoded = Endpoint::from_bytes(&ep.to_bytes());
        assert_eq!(decoded, ep);
        assert!(decoded.is_global());
    }

    #[test]
    fn test_zero_gid_is_local() {
        let ep = Endpoint {
            addr: 0,
            rkey: 0,
            qp_num: 0,
            lid: 5,
            gid: [0u8; 16],
        };
        assert!(!ep.is_global());
    }

    #[test]
    fn test_qp_state_order() {
        assert!(QpState::Reset.can_advance_to(QpState::Init));
        assert!(QpState::Init.can_advance_to(QpState::ReadyToReceive));
        assert!(QpState::ReadyToReceive.can_advance_to(QpState::ReadyToSend));
    }

    #[test]
    fn test_qp_state_rejects_skips_and_regressions() {
        // Skipping INIT is not allowed.
        assert!(!QpState::Reset.can_advance_to(QpState::ReadyToReceive));
        assert!(!QpState::Reset.can_advance_to(QpState::ReadyToSend));
        assert!(!QpState::Init.can_advance_to(QpState::ReadyToSend));
        // No regressions once established.
        assert!(!QpState::ReadyToSend.can_advance_to(QpState::Init));
        assert!(!QpState::ReadyToReceive.can_advance_to(QpState::Reset));
        // No self-transitions.
        assert!(!QpState::Init.can_advance_to(QpState::Init));
    }

    #[test]
    fn test_poll_loop_times_out_without_entries() {
        let result = poll_loop(100, Duration::ZERO, || Ok(None));
        assert!(matches!(
            result,
            Err(DmalinkError::PollTimeout { attempts: 100 })
        ));
    }

    #[test]
    fn test_poll_loop_returns_first_entry() {
        let mut calls = 0;
        let completion = poll_loop(100, Duration::ZERO, || {
            calls += 1;
            if calls == 3 {
                Ok(Some(Completion { wr_id: 42 }))
            } else {
                Ok(None)
            }
        })
        .unwrap();
        assert_eq!(completion.wr_id, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_loop_propagates_poll_errors() {
        let result = poll_loop(100, Duration::ZERO, || Err(DmalinkError::Poll));
        assert!(matches!(result, Err(DmalinkError::Poll)));
    }

    #[test]
    fn test_poll_loop_propagates_completion_status_errors() {
        let result: Result<Completion> = poll_loop(100, Duration::ZERO, || {
            Err(DmalinkError::CompletionStatus {
                status: "IBV_WC_RETRY_EXC_ERR".into(),
            })
        });
        assert!(matches!(
            result,
            Err(DmalinkError::CompletionStatus { .. })
        ));
    }
}
