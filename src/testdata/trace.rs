//! Replay-trace loading.
//!
//! A trace file is a JSON document whose top level is a heterogeneous
//! array: index 0 holds the packet list, index 2 (TCP traces only) a list
//! of client/server pair strings, index 3 the replay name. Payloads are
//! hex-encoded captures of the original app's traffic.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Client/server endpoint pair of the original capture, parsed from
/// `"<client_ip>.<client_port>-<server_ip>.<server_port>"`.
///
/// Only `server_port` is load-bearing on the client side; the rest is
/// retained for grouping and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSPair {
    pub client_ip: String,
    pub client_port: u16,
    pub server_ip: String,
    pub server_port: u16,
}

impl CSPair {
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || Error::InvalidTrace(format!("malformed c_s_pair: {s}"));

        let (client, server) = s.split_once('-').ok_or_else(malformed)?;
        // IPs contain dots themselves; the port is everything after the last one
        let (client_ip, client_port) = client.rsplit_once('.').ok_or_else(malformed)?;
        let (server_ip, server_port) = server.rsplit_once('.').ok_or_else(malformed)?;

        Ok(Self {
            client_ip: client_ip.to_string(),
            client_port: client_port.parse().map_err(|_| malformed())?,
            server_ip: server_ip.to_string(),
            server_port: server_port.parse().map_err(|_| malformed())?,
        })
    }
}

/// A TCP packet of a recorded replay.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub cs_pair: String,
    /// Seconds since the start of the recording.
    pub timestamp: f64,
    pub payload: Vec<u8>,
    /// Expected response length; unused by the client, retained for server
    /// compatibility.
    pub response_length: u64,
    /// Expected response hash; unused by the client.
    pub response_hash: String,
}

/// A UDP packet of a recorded replay.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub cs_pair: String,
    /// Seconds since the start of the recording.
    pub timestamp: f64,
    pub payload: Vec<u8>,
    /// Informational end-of-stream marker.
    pub end: bool,
}

/// Tagged packet variant; the data-plane clients type-switch on the tag.
#[derive(Debug, Clone)]
pub enum Packet {
    Tcp(TcpPacket),
    Udp(UdpPacket),
}

impl Packet {
    pub fn timestamp(&self) -> f64 {
        match self {
            Self::Tcp(p) => p.timestamp,
            Self::Udp(p) => p.timestamp,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Tcp(p) => &p.payload,
            Self::Udp(p) => &p.payload,
        }
    }
}

/// Everything a data-plane client needs to run one replay.
#[derive(Debug, Clone)]
pub struct ReplayInfo {
    /// Packets in send order.
    pub packets: Vec<Packet>,
    /// Server port the replay traffic targets.
    pub server_port: u16,
    /// Replay name announced to the server.
    pub replay_name: String,
    pub is_tcp: bool,
    /// Port tests send back-to-back with no pacing and a shorter timeout.
    /// The trace format carries no marker for this; upstream port-test
    /// traces set it when constructing the `ReplayInfo`.
    pub is_port_test: bool,
}

/// The raw shape a packet record takes in the trace file. `response_len`
/// is present exactly on TCP traces.
#[derive(Debug, Deserialize)]
struct RawPacket {
    c_s_pair: String,
    timestamp: f64,
    payload: String,
    response_len: Option<u64>,
    response_hash: Option<String>,
    end: Option<bool>,
}

/// Loads a replay trace from disk.
pub fn load_replay<P: AsRef<Path>>(path: P) -> Result<ReplayInfo> {
    let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        Error::InvalidTrace(format!("failed to read {}: {e}", path.as_ref().display()))
    })?;
    parse_replay(&data)
}

fn parse_replay(data: &str) -> Result<ReplayInfo> {
    let doc: Vec<serde_json::Value> =
        serde_json::from_str(data).map_err(|e| Error::InvalidTrace(format!("not a JSON array: {e}")))?;

    let raw_packets: Vec<RawPacket> = serde_json::from_value(
        doc.first()
            .cloned()
            .ok_or_else(|| Error::InvalidTrace("missing packet list".into()))?,
    )
    .map_err(|e| Error::InvalidTrace(format!("bad packet list: {e}")))?;

    if raw_packets.is_empty() {
        return Err(Error::InvalidTrace("empty packet list".into()));
    }

    let replay_name: String = serde_json::from_value(
        doc.get(3)
            .cloned()
            .ok_or_else(|| Error::InvalidTrace("missing replay name".into()))?,
    )
    .map_err(|e| Error::InvalidTrace(format!("bad replay name: {e}")))?;

    let is_tcp = raw_packets[0].response_len.is_some();

    let server_port = if is_tcp {
        let cs_pairs: Vec<String> = serde_json::from_value(
            doc.get(2)
                .cloned()
                .ok_or_else(|| Error::InvalidTrace("missing c_s_pair list".into()))?,
        )
        .map_err(|e| Error::InvalidTrace(format!("bad c_s_pair list: {e}")))?;
        let first = cs_pairs
            .first()
            .ok_or_else(|| Error::InvalidTrace("empty c_s_pair list".into()))?;
        CSPair::parse(first)?.server_port
    } else {
        CSPair::parse(&raw_packets[0].c_s_pair)?.server_port
    };

    let mut packets = Vec::with_capacity(raw_packets.len());
    for raw in raw_packets {
        let payload = hex::decode(&raw.payload)
            .map_err(|e| Error::InvalidTrace(format!("bad payload hex: {e}")))?;
        let packet = if is_tcp {
            Packet::Tcp(TcpPacket {
                cs_pair: raw.c_s_pair,
                timestamp: raw.timestamp,
                payload,
                response_length: raw.response_len.unwrap_or(0),
                response_hash: raw.response_hash.unwrap_or_default(),
            })
        } else {
            Packet::Udp(UdpPacket {
                cs_pair: raw.c_s_pair,
                timestamp: raw.timestamp,
                payload,
                end: raw.end.unwrap_or(false),
            })
        };
        packets.push(packet);
    }

    Ok(ReplayInfo {
        packets,
        server_port,
        replay_name,
        is_tcp,
        is_port_test: false,
    })
}
