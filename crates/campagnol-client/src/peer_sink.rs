//! The concrete [`campagnol_ratelimit::DatagramWrite`] a peer's DTLS
//! session writes DTLS records through: the shared UDP socket, bound to
//! one fixed destination for this peer's lifetime.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;

use campagnol_ratelimit::DatagramWrite;

pub struct UdpPeerSink {
    socket: Arc<UdpSocket>,
    dest: SocketAddrV4,
}

impl UdpPeerSink {
    pub fn new(socket: Arc<UdpSocket>, dest: SocketAddrV4) -> Self {
        Self { socket, dest }
    }
}

impl DatagramWrite for UdpPeerSink {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, SocketAddr::V4(self.dest))
    }
}
