//! UDP replay client.
//!
//! Same contract as the TCP client with two differences dictated by the
//! transport: the sender must cancel on completion (UDP has no FIN to tell
//! the receiver the replay is over), and receive-side errors that are not
//! timeouts are fatal.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{replay_timeout, READ_DEADLINE, RECV_BUFFER_SIZE};
use crate::analyzer::Analyzer;
use crate::error::{Error, Result};
use crate::testdata::{Packet, ReplayInfo};

/// Replays a recorded UDP trace against one server.
pub struct UdpReplayClient {
    socket: Arc<UdpSocket>,
    timeout: Duration,
}

impl UdpReplayClient {
    /// Binds an unbound source socket of the matching address family and
    /// connects it to the server endpoint.
    pub async fn connect(ip: IpAddr, port: u16, timing: bool) -> Result<Self> {
        let bind_addr: SocketAddr = if ip.is_ipv6() {
            SocketAddr::from(([0u8; 16], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::ReplayIo(format!("bind {bind_addr}: {e}")))?;

        let addr = SocketAddr::new(ip, port);
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::ReplayIo(format!("connect to {addr}: {e}")))?;

        Ok(Self {
            socket: Arc::new(socket),
            timeout: replay_timeout(timing),
        })
    }

    /// Runs the sender and receiver to completion.
    pub async fn run(
        self,
        replay: Arc<ReplayInfo>,
        timing: bool,
        analyzer: Arc<Analyzer>,
        token: CancellationToken,
    ) -> Result<()> {
        let sender = tokio::spawn(send_packets(
            Arc::clone(&self.socket),
            replay,
            timing,
            self.timeout,
            token.clone(),
        ));
        let receiver = tokio::spawn(recv_packets(self.socket, analyzer, token));

        let (send_result, recv_result) = tokio::join!(sender, receiver);
        send_result.map_err(|e| Error::ReplayIo(format!("send task: {e}")))??;
        recv_result.map_err(|e| Error::ReplayIo(format!("recv task: {e}")))??;
        Ok(())
    }
}

async fn send_packets(
    socket: Arc<UdpSocket>,
    replay: Arc<ReplayInfo>,
    timing: bool,
    replay_timeout: Duration,
    token: CancellationToken,
) -> Result<()> {
    let start = Instant::now();
    let deadline = start + replay_timeout;
    let total = replay.packets.len();

    for (i, packet) in replay.packets.iter().enumerate() {
        if token.is_cancelled() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            debug!(elapsed = ?start.elapsed(), "replay timeout reached, stopping send loop");
            token.cancel();
            return Ok(());
        }

        let payload = match packet {
            Packet::Udp(p) => &p.payload,
            Packet::Tcp(_) => {
                token.cancel();
                return Err(Error::ReplayIo("TCP packet in a UDP replay trace".into()));
            }
        };

        if timing {
            let target = start + Duration::from_secs_f64(packet.timestamp().max(0.0));
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                () = sleep_until(target.min(deadline)) => {}
            }
            if target > deadline {
                debug!(elapsed = ?start.elapsed(), "replay timeout reached mid-pacing");
                token.cancel();
                return Ok(());
            }
        }

        trace!("sending packet {}/{} at {:.3}s", i + 1, total, packet.timestamp());
        if let Err(err) = socket.send(payload).await {
            debug!(%err, "send failed, cancelling replay");
            token.cancel();
            return Err(Error::ReplayIo(format!("send: {err}")));
        }
    }

    // no FIN on UDP; signal the receiver that the trace is done
    token.cancel();
    Ok(())
}

async fn recv_packets(
    socket: Arc<UdpSocket>,
    analyzer: Arc<Analyzer>,
    token: CancellationToken,
) -> Result<()> {
    analyzer.run();
    let result = recv_loop(&socket, &analyzer, &token).await;
    analyzer.stop();
    result
}

async fn recv_loop(
    socket: &UdpSocket,
    analyzer: &Analyzer,
    token: &CancellationToken,
) -> Result<()> {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        match timeout(READ_DEADLINE, socket.recv(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(n)) => {
                analyzer.add_bytes_read(n);
                trace!("received {n} bytes from server");
            }
            Ok(Err(err)) => {
                token.cancel();
                return Err(Error::ReplayIo(format!("recv: {err}")));
            }
        }
    }
}
