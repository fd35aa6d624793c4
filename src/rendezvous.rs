//! Out-of-band rendezvous: a blocking TCP exchange of connection endpoints.
//!
//! The protocol is symmetric and deadlock-free: both sides write their
//! serialized endpoint before reading the peer's, then trade a single sync
//! byte so neither touches its queue pair until the other has the full
//! descriptor. After the RDMA phase the same socket carries a one-byte
//! completion signal from the client to the server.

use crate::error::{DmalinkError, Result};
use crate::rdma::{Endpoint, ENDPOINT_WIRE_SIZE};
use socket2::{Domain, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

/// Byte traded after the descriptor exchange to lock-step both peers.
const SYNC_BYTE: u8 = b'Q';

/// Byte the client sends when its RDMA phase is finished.
const DONE_BYTE: u8 = b'D';

/// A bound listener that has not yet accepted its single peer.
pub struct RendezvousListener {
    listener: TcpListener,
}

impl RendezvousListener {
    /// Bind `port` on all interfaces with address reuse and a backlog of
    /// exactly one. Port 0 picks an ephemeral port (see [`Self::local_port`]).
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        Ok(Self {
            listener: socket.into(),
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept exactly one peer and stop listening.
    pub fn accept(self) -> Result<Rendezvous> {
        let (stream, peer) = self.listener.accept()?;
        tracing::info!(%peer, "peer connected");
        Ok(Rendezvous { stream })
    }
}

/// An established rendezvous channel to the single peer.
pub struct Rendezvous {
    stream: TcpStream,
}

impl Rendezvous {
    /// Connect to the server at `host:port` (client role).
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        tracing::info!(host, port, "connected to peer");
        Ok(Self { stream })
    }

    /// Listen on `port` and accept the single peer (server role).
    pub fn accept(port: u16) -> Result<Self> {
        RendezvousListener::bind(port)?.accept()
    }

    /// Trade connection endpoints with the peer.
    ///
    /// Writes the local endpoint (one 34-byte record), reads the remote
    /// one, then exchanges the sync byte. Any short read or write is a hard
    /// exchange failure; there is no partial-record recovery.
    pub fn exchange(&mut self, local: &Endpoint) -> Result<Endpoint> {
        self.stream
            .write_all(&local.to_bytes())
            .map_err(|e| DmalinkError::exchange(format!("endpoint write failed: {e}")))?;

        let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| DmalinkError::exchange(format!("endpoint read failed: {e}")))?;
        let remote = Endpoint::from_bytes(&buf);

        self.stream
            .write_all(&[SYNC_BYTE])
            .map_err(|e| DmalinkError::exchange(format!("sync write failed: {e}")))?;
        let mut ack = [0u8; 1];
        self.stream
            .read_exact(&mut ack)
            .map_err(|e| DmalinkError::exchange(format!("sync read failed: {e}")))?;

        tracing::debug!(
            qp_num = remote.qp_num,
            lid = remote.lid,
            "endpoint exchange complete"
        );
        Ok(remote)
    }

    /// Signal the peer that the RDMA phase is finished (client side).
    pub fn signal_done(&mut self) -> Result<()> {
        self.stream
            .write_all(&[DONE_BYTE])
            .map_err(|e| DmalinkError::exchange(format!("done signal failed: {e}")))?;
        Ok(())
    }

    /// Block until the peer signals completion (server side).
    pub fn wait_done(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        self.stream
            .read_exact(&mut byte)
            .map_err(|e| DmalinkError::exchange(format!("done wait failed: {e}")))?;
        Ok(())
    }
}
