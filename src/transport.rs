//! The datagram transport driven by the session service.
//!
//! The service only relies on the [`Transport`] contract: queue a packet for a destination and
//! poll for the next decoded inbound packet. Datagram semantics are assumed throughout, packets
//! may be lost, reordered or duplicated and the session layer compensates.
//!
//! [`UdpTransport`] is the standard implementation. It owns a non-blocking UDP socket, encodes
//! and decodes packets at the socket boundary and drops undecodable datagrams.

use crate::packet::{Magic, Packet, MAX_PACKET_SIZE};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll, Waker};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tracing::debug;

/// The datagram contract consumed by the session service.
pub trait Transport: Unpin + Send + 'static {
    /// Queues a packet for `dst`. Sends are best-effort, transmission failures are logged and
    /// the packet is dropped. Reliability is provided by the session layer's retransmissions.
    fn send(&mut self, dst: SocketAddr, packet: Packet);

    /// Polls for the next inbound packet, flushing any queued outbound packets first.
    fn poll_packet(&mut self, cx: &mut Context<'_>) -> Poll<(SocketAddr, Packet)>;
}

/// A [`Transport`] over a UDP socket.
pub struct UdpTransport {
    /// The UDP socket.
    socket: UdpSocket,
    /// Packets awaiting transmission.
    send_queue: VecDeque<(SocketAddr, Packet)>,
    /// The receive buffer for inbound datagrams.
    recv_buffer: [u8; MAX_PACKET_SIZE],
    /// The local WHOAREYOU magic, used to recognise challenges addressed to us.
    magic: Magic,
    /// Wakes the polling task when a packet is queued outside of a poll.
    waker: Option<Waker>,
}

impl UdpTransport {
    /// Binds a UDP socket on `listen_addr`. Must be called within a tokio runtime.
    pub fn bind(listen_addr: SocketAddr, magic: Magic) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(listen_addr)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        Ok(UdpTransport {
            socket,
            send_queue: VecDeque::new(),
            recv_buffer: [0; MAX_PACKET_SIZE],
            magic,
            waker: None,
        })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, dst: SocketAddr, packet: Packet) {
        self.send_queue.push_back((dst, packet));
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn poll_packet(&mut self, cx: &mut Context<'_>) -> Poll<(SocketAddr, Packet)> {
        self.waker = Some(cx.waker().clone());

        // flush the outbound queue
        while let Some((dst, packet)) = self.send_queue.front() {
            let encoded = packet.encode();
            match self.socket.poll_send_to(cx, &encoded, *dst) {
                Poll::Ready(Ok(_)) => {
                    self.send_queue.pop_front();
                }
                Poll::Ready(Err(e)) => {
                    debug!(error = %e, "Failed to send UDP packet");
                    self.send_queue.pop_front();
                }
                Poll::Pending => break,
            }
        }

        let UdpTransport {
            socket,
            recv_buffer,
            magic,
            ..
        } = self;

        loop {
            let mut buf = ReadBuf::new(recv_buffer);
            match socket.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(src)) => match Packet::decode(buf.filled(), magic) {
                    Ok(packet) => return Poll::Ready((src, packet)),
                    Err(e) => {
                        debug!(%src, error = %e, "Failed to decode inbound packet");
                    }
                },
                Poll::Ready(Err(e)) => {
                    debug!(error = %e, "UDP socket receive error");
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
