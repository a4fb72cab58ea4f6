//! Bridges between byte streams and single-peer packet channels.
//!
//! Neither adapter buffers or reorders anything: whatever delivery guarantees
//! the wrapped channel has pass through unchanged.

use std::{
    future::poll_fn,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{ready, Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
};

/// A connectionless channel, in the shape of `UdpSocket`'s poll API.
pub trait PacketConn {
    fn poll_recv_from(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>>;

    fn poll_send_to(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>>;
}

impl PacketConn for UdpSocket {
    fn poll_recv_from(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        UdpSocket::poll_recv_from(self, cx, buf)
    }

    fn poll_send_to(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        UdpSocket::poll_send_to(self, cx, buf, target)
    }
}

pub async fn recv_from<P: PacketConn + ?Sized>(
    conn: &mut P,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(&mut *buf);
        let from = ready!(conn.poll_recv_from(cx, &mut read_buf))?;
        Poll::Ready(Ok((read_buf.filled().len(), from)))
    })
    .await
}

pub async fn send_to<P: PacketConn + ?Sized>(
    conn: &mut P,
    buf: &[u8],
    target: SocketAddr,
) -> io::Result<usize> {
    poll_fn(|cx| conn.poll_send_to(cx, buf, target)).await
}

/// A stream seen as a packet channel with exactly one peer.
///
/// Every read reports `peer` as its source and every write goes to the stream
/// whatever destination it names.
pub struct StreamPacket<S> {
    stream: S,
    peer: SocketAddr,
}

impl<S> StreamPacket<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        StreamPacket { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketConn for StreamPacket<S> {
    fn poll_recv_from(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        ready!(Pin::new(&mut self.stream).poll_read(cx, buf))?;
        Poll::Ready(Ok(self.peer))
    }

    fn poll_send_to(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
        _target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }
}

/// A packet channel seen as a stream to one fixed peer. Reads drop the
/// reported source; writes always target `peer`.
///
/// Empty datagrams are skipped on read, so a zero-length read only ever means
/// the caller passed an empty buffer.
pub struct PacketStream<P> {
    conn: P,
    peer: SocketAddr,
}

impl<P> PacketStream<P> {
    pub fn new(conn: P, peer: SocketAddr) -> Self {
        PacketStream { conn, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl<P: PacketConn + Unpin> AsyncRead for PacketStream<P> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            let before = buf.filled().len();
            ready!(this.conn.poll_recv_from(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<P: PacketConn + Unpin> AsyncWrite for PacketStream<P> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let peer = this.peer;
        this.conn.poll_send_to(cx, buf, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn stream_packet_pins_source_and_destination() {
        let peer: SocketAddr = "198.51.100.1:53".parse().unwrap();
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut packet = StreamPacket::new(local, peer);

        let elsewhere: SocketAddr = "203.0.113.9:9999".parse().unwrap();
        let n = send_to(&mut packet, b"query", elsewhere).await.unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");

        remote.write_all(b"answer").await.unwrap();
        let (n, from) = recv_from(&mut packet, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, peer);
    }

    #[tokio::test]
    async fn packet_stream_targets_fixed_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        let mut stream = PacketStream::new(local, peer.local_addr().unwrap());

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, local_addr);

        // the source of incoming datagrams is not checked, only dropped
        other.send_to(b"pong", local_addr).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn empty_datagrams_are_not_end_of_stream() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        let mut stream = PacketStream::new(local, peer.local_addr().unwrap());

        peer.send_to(b"", local_addr).await.unwrap();
        peer.send_to(b"after", local_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }
}
