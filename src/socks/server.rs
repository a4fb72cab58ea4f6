use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use slog::{debug, info, o, warn};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::dialer::{Network, PacketSession};
use crate::packet::{recv_from, send_to};
use crate::relay::Proxy;
use crate::socks::socks5::{self, Command, Request, Status};
use crate::socks::{udp, SOCKS5};

const MAX_DATAGRAM_SIZE: usize = 65535;
const UDP_QUEUE_DEPTH: usize = 64;
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Server<P> {
    pub logger: slog::Logger,
    pub proxy: Arc<P>,
}

impl<P: Proxy + 'static> Server<P> {
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(self.logger, "server started"; "addr" => %local_addr);

        let mut conn_id: u64 = 0;
        loop {
            conn_id += 1;
            match listener.accept().await {
                Ok((conn, addr)) => {
                    let h = Handler {
                        logger: self.logger.new(o!("id" => conn_id)),
                        proxy: self.proxy.clone(),
                        local_ip: local_addr.ip(),
                    };
                    tokio::spawn(h.handle(conn, addr));
                }
                Err(err) => {
                    slog::error!(self.logger, "failed to accept"; "err" => %err);
                }
            }
        }
    }
}

struct Handler<P> {
    logger: slog::Logger,
    proxy: Arc<P>,
    local_ip: IpAddr,
}

impl<P: Proxy + 'static> Handler<P> {
    async fn handle(self, client: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = self.handle_conn(client, client_addr).await {
            slog::error!(self.logger, "proxy failed"; "err" => %e);
        }
    }

    async fn handle_conn(&self, client: TcpStream, client_addr: SocketAddr) -> anyhow::Result<()> {
        let started_at = Instant::now();
        info!(self.logger, "proxy start"; "client_addr" => client_addr);

        let (mut client_reader, mut client_writer) = {
            let (r, w) = client.into_split();
            (BufReader::new(r), w)
        };
        let mut preamble: [u8; 2] = Default::default();
        client_reader.read_exact(&mut preamble).await?;

        let version = preamble[0];
        if version != SOCKS5 {
            bail!("unsupported SOCKS version: {}", version);
        }
        let request = socks5::handle(&mut client_reader, &mut client_writer, preamble[1]).await?;

        match request.command {
            Command::Connect => {
                self.connect(client_reader, client_writer, &request).await?;
            }
            Command::UdpAssociate => {
                self.udp_associate(client_reader, client_writer, client_addr)
                    .await?;
            }
        }

        let elapsed = started_at.elapsed();
        info!(self.logger, "proxy done"; "elapsed" => ?elapsed);
        Ok(())
    }

    async fn connect(
        &self,
        client_reader: impl AsyncBufRead + Unpin,
        mut client_writer: impl AsyncWrite + Unpin,
        request: &Request,
    ) -> anyhow::Result<()> {
        let target = request.target();
        let upstream = match self.proxy.dial(Network::Tcp, &target).await {
            Ok((upstream, _)) => upstream,
            Err(e) => {
                socks5::write_response(&mut client_writer, Status::from(&e), None).await?;
                return Err(e).with_context(|| format!("failed to dial {target}"));
            }
        };
        socks5::write_response(&mut client_writer, Status::Granted, None).await?;

        let (upstream_reader, upstream_writer) = {
            let (r, w) = tokio::io::split(upstream);
            (BufReader::new(r), w)
        };
        let (uploaded_bytes, downloaded_bytes) = self
            .do_proxy(
                client_reader,
                client_writer,
                upstream_reader,
                upstream_writer,
            )
            .await?;

        info!(self.logger, "connect done";
            "target" => target,
            "downloaded_bytes" => downloaded_bytes,
            "uploaded_bytes" => uploaded_bytes,
        );
        Ok(())
    }

    async fn do_proxy(
        &self,
        client_reader: impl AsyncBufRead + Unpin,
        client_writer: impl AsyncWrite + Unpin,
        upstream_reader: impl AsyncBufRead + Unpin,
        upstream_writer: impl AsyncWrite + Unpin,
    ) -> io::Result<(u64, u64)> {
        tokio::try_join!(
            self.copy_and_drop(client_reader, upstream_writer),
            self.copy_and_drop(upstream_reader, client_writer),
        )
    }

    async fn copy_and_drop(
        &self,
        mut reader: impl AsyncBufRead + Unpin,
        mut writer: impl AsyncWrite + Unpin,
    ) -> io::Result<u64> {
        let n = tokio::io::copy_buf(&mut reader, &mut writer).await?;
        // the peer may already be gone
        writer.shutdown().await.ok();
        drop(writer);
        drop(reader);
        Ok(n)
    }

    /// Relays datagrams between the client and one packet session per
    /// destination until the control connection closes.
    async fn udp_associate(
        &self,
        mut client_reader: impl AsyncRead + Unpin,
        mut client_writer: impl AsyncWrite + Unpin,
        client_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let socket = match UdpSocket::bind((self.local_ip, 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                socks5::write_response(&mut client_writer, Status::GeneralFailure, None).await?;
                return Err(e).context("failed to bind udp relay");
            }
        };
        let relay_addr = socket.local_addr()?;
        socks5::write_response(&mut client_writer, Status::Granted, Some(relay_addr)).await?;
        info!(self.logger, "udp associate"; "relay_addr" => %relay_addr);

        let mut sessions: HashMap<String, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut client_udp: Option<SocketAddr> = None;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut control = [0u8; 1];
        loop {
            let (n, from) = tokio::select! {
                read = client_reader.read(&mut control) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
                received = socket.recv_from(&mut buf) => received?,
            };
            if from.ip() != client_addr.ip() || client_udp.is_some_and(|addr| addr != from) {
                debug!(self.logger, "dropping datagram from stranger"; "from" => %from);
                continue;
            }
            client_udp = Some(from);

            let datagram = match udp::Datagram::decode(&buf[..n]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!(self.logger, "dropping datagram"; "err" => %e);
                    continue;
                }
            };
            let target = datagram.target();
            if let Some(tx) = sessions.get(&target) {
                match tx.try_send(datagram.data.to_vec()) {
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        sessions.remove(&target);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(self.logger, "udp queue full"; "target" => &target);
                        continue;
                    }
                    Ok(()) => continue,
                }
            }

            sessions.retain(|_, tx| !tx.is_closed());
            let (tx, rx) = mpsc::channel(UDP_QUEUE_DEPTH);
            // fresh channel with spare capacity
            tx.try_send(datagram.data.to_vec()).ok();
            tokio::spawn(relay_session(
                self.proxy.clone(),
                target.clone(),
                rx,
                socket.clone(),
                from,
                self.logger.new(o!("target" => target.clone())),
            ));
            sessions.insert(target, tx);
        }

        info!(self.logger, "udp associate done"; "sessions" => sessions.len());
        Ok(())
    }
}

enum Event {
    Outbound(Vec<u8>),
    Inbound(usize, SocketAddr),
}

/// Dials `target` and relays between it and the client until either side
/// goes away or nothing moves for `UDP_IDLE_TIMEOUT`.
async fn relay_session<P: Proxy>(
    proxy: Arc<P>,
    target: String,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    logger: slog::Logger,
) {
    let (mut session, peer) = match proxy.dial_udp(Network::Udp, &target).await {
        Ok((session, _, peer)) => (session, peer),
        Err(e) => {
            warn!(logger, "udp dial failed"; "err" => %e);
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (mut sent, mut received) = (0u64, 0u64);
    loop {
        let event = tokio::select! {
            data = outbound.recv() => match data {
                Some(data) => Event::Outbound(data),
                None => break,
            },
            read = recv_from(&mut session, &mut buf) => match read {
                Ok((0, _)) => break,
                Ok((n, from)) => Event::Inbound(n, from),
                Err(e) => {
                    debug!(logger, "udp session read failed"; "err" => %e);
                    break;
                }
            },
            _ = tokio::time::sleep(UDP_IDLE_TIMEOUT) => {
                debug!(logger, "udp session idle");
                break;
            }
        };
        let result = match event {
            Event::Outbound(data) => {
                sent += 1;
                send_to(&mut session, &data, peer).await.map(drop)
            }
            Event::Inbound(n, from) => {
                received += 1;
                socket
                    .send_to(&udp::encode(from, &buf[..n]), client)
                    .await
                    .map(drop)
            }
        };
        if let Err(e) = result {
            debug!(logger, "udp relay failed"; "err" => %e);
            break;
        }
    }
    debug!(logger, "udp session closed"; "sent" => sent, "received" => received);
}
