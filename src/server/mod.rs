//! Server bootstrap and per-server connection state.
//!
//! A [`Server`] owns everything the client holds open against one replay
//! machine: the resolved address, the side-channel connection, and (for
//! MLab machines) the admission WebSocket. Only the orchestrator issues
//! side-channel requests, strictly one at a time.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{SideChannel, SIDE_CHANNEL_PORT};
use crate::testdata::KS2Result;

pub mod mlab;

/// Hostname whose selection forces the MLab path.
pub const USE_MLAB_HOSTNAME: &str = "wehe4.meddle.mobi";

/// Reply cap for the UDP public-IP probe.
const PUBLIC_IP_REPLY_SIZE: usize = 256;

/// Receive-side statistics of one finished replay, kept until the
/// Throughputs report for that replay has been sent.
#[derive(Debug, Clone)]
pub struct ReplayStats {
    pub duration: Duration,
    pub throughputs: Vec<f64>,
    pub sample_times: Vec<f64>,
    pub average_throughput: f64,
}

/// One replay server the test runs against.
pub struct Server {
    pub hostname: String,
    pub ip: IpAddr,
    /// Side-channel port; the production value is [`SIDE_CHANNEL_PORT`].
    pub side_channel_port: u16,
    pub side_channel: Option<SideChannel>,
    /// MLab admission WebSocket. Liveness token only — no frames are ever
    /// sent; holding it open rate-limits access to the machine.
    pub websocket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    /// Locator candidates attempted up to and including this machine.
    pub num_mlab_tries: u32,
    /// Stats of the most recent replay, pending the Throughputs report.
    pub last_replay: Option<ReplayStats>,
}

impl Server {
    /// Resolves `hostname` and builds an unconnected server record.
    pub async fn new(hostname: &str) -> Result<Self> {
        let ip = resolve(hostname).await?;
        debug!(hostname, %ip, "resolved server");
        Ok(Self {
            hostname: hostname.to_string(),
            ip,
            side_channel_port: SIDE_CHANNEL_PORT,
            side_channel: None,
            websocket: None,
            num_mlab_tries: 0,
            last_replay: None,
        })
    }

    /// Opens the MLab admission WebSocket and keeps it for the test's
    /// lifetime.
    pub async fn open_websocket(&mut self, url: &str) -> Result<()> {
        let (websocket, _response) = tokio_tungstenite::connect_async(url).await?;
        self.websocket = Some(websocket);
        Ok(())
    }

    /// Connects the side channel; `id` distinguishes channels in logs.
    pub async fn connect_side_channel(&mut self, id: usize) -> Result<()> {
        let channel = SideChannel::connect(id, self.ip, self.side_channel_port).await?;
        self.side_channel = Some(channel);
        Ok(())
    }

    fn side_channel_mut(&mut self) -> Result<&mut SideChannel> {
        self.side_channel
            .as_mut()
            .ok_or_else(|| Error::SideChannel("side channel not connected".into()))
    }

    /// Discovers this client's public IP as seen at the replay port, then
    /// announces the test over the side channel.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_id(
        &mut self,
        is_tcp: bool,
        replay_port: u16,
        user_id: &str,
        replay_id: u32,
        replay_name: &str,
        test_id: u32,
        is_last_replay: bool,
        client_version: &str,
    ) -> Result<()> {
        let public_ip = self.public_ip(replay_port, is_tcp).await?;
        let num_mlab_tries = self.num_mlab_tries;
        self.side_channel_mut()?
            .send_id(
                user_id,
                replay_id,
                replay_name,
                num_mlab_tries,
                test_id,
                is_last_replay,
                &public_ip,
                client_version,
            )
            .await
    }

    /// Fetches the client's public IP at the test port. TCP tests use an
    /// HTTP GET against the replay port; UDP tests exchange a datagram.
    pub async fn public_ip(&self, port: u16, is_tcp: bool) -> Result<String> {
        if is_tcp {
            let url = format!("http://{}:{port}/WHATSMYIPMAN", self.hostname);
            http_get(&url).await
        } else {
            let bind_addr: SocketAddr = if self.ip.is_ipv6() {
                SocketAddr::from(([0u8; 16], 0))
            } else {
                SocketAddr::from(([0u8; 4], 0))
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect((self.ip, port)).await?;
            socket.send(b"WHATSMYIPMAN").await?;
            let mut reply = vec![0u8; PUBLIC_IP_REPLY_SIZE];
            let n = socket.recv(&mut reply).await?;
            String::from_utf8(reply[..n].to_vec())
                .map_err(|e| Error::ProtocolMismatch(format!("public IP reply not UTF-8: {e}")))
        }
    }

    pub async fn ask4_permission(&mut self) -> Result<u32> {
        self.side_channel_mut()?.ask4_permission().await
    }

    pub async fn declare_replay(
        &mut self,
        replay_id: u32,
        replay_name: &str,
        is_last_replay: bool,
    ) -> Result<u32> {
        self.side_channel_mut()?
            .declare_replay(replay_id, replay_name, is_last_replay)
            .await
    }

    /// Reports the pending replay's duration and throughput series; returns
    /// the client-side average throughput of that replay.
    pub async fn send_throughputs(&mut self) -> Result<f64> {
        let stats = self
            .last_replay
            .take()
            .ok_or_else(|| Error::SideChannel("no replay stats to report".into()))?;
        self.side_channel_mut()?
            .send_throughputs(stats.duration, &stats.throughputs, &stats.sample_times)
            .await?;
        Ok(stats.average_throughput)
    }

    pub async fn analyze_test(&mut self) -> Result<KS2Result> {
        self.side_channel_mut()?.analyze_test().await
    }

    /// Drops the side channel. The WebSocket stays open across the tests
    /// of one run; [`Server::close`] releases it.
    pub fn release_side_channel(&mut self) {
        self.side_channel = None;
    }

    /// Releases every connection this server holds.
    pub async fn close(&mut self) {
        self.side_channel = None;
        if let Some(mut websocket) = self.websocket.take() {
            if let Err(err) = websocket.close(None).await {
                warn!(hostname = %self.hostname, %err, "error closing MLab websocket");
            }
        }
    }
}

/// Resolves a hostname to its first address.
async fn resolve(host: &str) -> Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| Error::Dns {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    addrs.next().map(|a| a.ip()).ok_or_else(|| Error::Dns {
        host: host.to_string(),
        reason: "no addresses returned".into(),
    })
}

/// Decides whether the MLab federation should serve this run: either the
/// user asked for the MLab display host, or their network resolves the
/// display host to IPv6.
pub async fn use_mlab(display: &str) -> Result<bool> {
    if display == USE_MLAB_HOSTNAME {
        return Ok(true);
    }
    Ok(resolve(display).await?.is_ipv6())
}

/// Builds the server set the test run fans out over.
///
/// MLab path: locator + WebSocket admission, exactly `num_servers`
/// machines or failure. Direct path: a single resolved host; more than one
/// server without MLab is refused.
pub async fn bootstrap_servers(cfg: &Config) -> Result<Vec<Server>> {
    if use_mlab(&cfg.server_display).await? {
        mlab::connect_servers(cfg.num_servers).await
    } else {
        if cfg.num_servers > 1 {
            return Err(Error::SingleServerOnly(cfg.server_display.clone()));
        }
        Ok(vec![Server::new(&cfg.server_display).await?])
    }
}

/// HTTP GET returning the body, with non-2xx statuses as errors.
pub(crate) async fn http_get(url: &str) -> Result<String> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}
