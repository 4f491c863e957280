//! TCP replay client: paced send plus deadline-bounded receive over a
//! single connection.
//!
//! The sender walks the trace in order, sleeping until each packet's
//! recorded offset; the receiver feeds every read into the throughput
//! analyzer. Both tasks share one cancellation token and terminate
//! together: whichever ends first cancels the other, and the peer observes
//! it within one read deadline.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{replay_timeout, READ_DEADLINE, RECV_BUFFER_SIZE};
use crate::analyzer::Analyzer;
use crate::error::{Error, Result};
use crate::testdata::{Packet, ReplayInfo};

/// Replays a recorded TCP trace against one server.
pub struct TcpReplayClient {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    timeout: Duration,
}

impl TcpReplayClient {
    /// Connects to the replay port advertised for this trace.
    pub async fn connect(ip: IpAddr, port: u16, timing: bool) -> Result<Self> {
        let addr = SocketAddr::new(ip, port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ReplayIo(format!("connect to {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            read_half,
            write_half,
            timeout: replay_timeout(timing),
        })
    }

    /// Runs the sender and receiver to completion; returns when both have
    /// finished. The connection closes when the halves drop.
    pub async fn run(
        self,
        replay: Arc<ReplayInfo>,
        timing: bool,
        analyzer: Arc<Analyzer>,
        token: CancellationToken,
    ) -> Result<()> {
        let sender = tokio::spawn(send_packets(
            self.write_half,
            replay,
            timing,
            self.timeout,
            token.clone(),
        ));
        let receiver = tokio::spawn(recv_packets(self.read_half, analyzer, token));

        let (send_result, recv_result) = tokio::join!(sender, receiver);
        send_result.map_err(|e| Error::ReplayIo(format!("send task: {e}")))??;
        recv_result.map_err(|e| Error::ReplayIo(format!("recv task: {e}")))??;
        Ok(())
    }
}

/// Sends the trace in order, paced to the recorded timestamps when
/// `timing` is set. Write failures cancel the replay but are not surfaced;
/// the receive side sees the close (or the token) and winds down.
async fn send_packets(
    mut write_half: OwnedWriteHalf,
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
            Packet::Tcp(p) => &p.payload,
            Packet::Udp(_) => {
                token.cancel();
                return Err(Error::ReplayIo("UDP packet in a TCP replay trace".into()));
            }
        };

        if timing {
            // sleep to the packet's recorded offset, never past the replay cap
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
        if let Err(err) = write_half.write_all(payload).await {
            debug!(%err, "write failed, cancelling replay");
            token.cancel();
            return Ok(());
        }
    }
    Ok(())
}

/// Drives the analyzer for its lifetime: every successful read credits its
/// byte count. EOF means the server finished sending and closed.
async fn recv_packets(
    mut read_half: OwnedReadHalf,
    analyzer: Arc<Analyzer>,
    token: CancellationToken,
) -> Result<()> {
    analyzer.run();
    let result = recv_loop(&mut read_half, &analyzer, &token).await;
    analyzer.stop();
    result
}

async fn recv_loop(
    read_half: &mut OwnedReadHalf,
    analyzer: &Analyzer,
    token: &CancellationToken,
) -> Result<()> {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        // short deadline so a cancelled peer is observed promptly
        match timeout(READ_DEADLINE, read_half.read(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                debug!("server closed the replay connection");
                token.cancel();
                return Ok(());
            }
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
