//! Side channel for communicating test metadata with the server.
//!
//! A single persistent TCP connection per server, port 55556. Both
//! directions are length-prefixed: a request packs opcode and 24-bit
//! big-endian body length into one 32-bit word whose high byte is the
//! opcode; a response carries a 32-bit big-endian length followed by a
//! body whose first byte is the response code.
//!
//! The channel is a strict request/response pipe — a new request is never
//! written before the previous response has been read in full.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, PermissionError, Result};
use crate::testdata::KS2Result;

/// Port the replay server listens on for side-channel connections.
pub const SIDE_CHANNEL_PORT: u16 = 55556;

/// Largest body length expressible in the 24-bit request header.
const MAX_REQUEST_BODY: usize = 0x00FF_FFFF;

/// Request opcodes understood by the replay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Legacy declare; kept for wire compatibility, never sent.
    OldDeclareId = 0x30,
    ReceiveId = 0x31,
    Ask4Permission = 0x32,
    /// Mobile-stats upload; present in the protocol, unused by this client.
    MobileStats = 0x33,
    Throughputs = 0x34,
    DeclareReplay = 0x35,
    AnalyzeTest = 0x36,
}

const OK_RESPONSE: u8 = 0x00;
const ERROR_RESPONSE: u8 = 0x01;

/// A decoded response frame: the status byte and the remaining body.
struct Reply {
    code: u8,
    body: String,
}

impl Reply {
    /// Returns the body of an OK reply; anything else is an error.
    fn into_ok(self) -> Result<String> {
        match self.code {
            OK_RESPONSE => Ok(self.body),
            ERROR_RESPONSE if self.body.is_empty() => {
                Err(Error::SideChannel("server unable to process request".into()))
            }
            ERROR_RESPONSE => Err(Error::SideChannel(format!(
                "server rejected request: {}",
                self.body
            ))),
            code => Err(Error::ProtocolMismatch(format!(
                "unknown response code {code:#04x}"
            ))),
        }
    }
}

/// Control connection to one replay server.
pub struct SideChannel {
    id: usize,
    stream: TcpStream,
}

impl SideChannel {
    /// Connects to the side channel of the server at `ip`.
    pub async fn connect(id: usize, ip: IpAddr, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(ip, port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::SideChannel(format!("connect to {addr}: {e}")))?;
        debug!(id, %addr, "side channel connected");
        Ok(Self { id, stream })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Announces the test and its first replay.
    ///
    /// The server sends no acknowledgement for `ReceiveID`; callers are
    /// expected to pause before the next request.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_id(
        &mut self,
        user_id: &str,
        replay_id: u32,
        replay_name: &str,
        num_mlab_tries: u32,
        test_id: u32,
        is_last_replay: bool,
        public_ip: &str,
        client_version: &str,
    ) -> Result<()> {
        let message = [
            user_id,
            &replay_id.to_string(),
            replay_name,
            &num_mlab_tries.to_string(),
            &test_id.to_string(),
            title_bool(is_last_replay),
            public_ip,
            client_version,
        ]
        .join(";");
        self.send_request(Opcode::ReceiveId, &message).await
    }

    /// Asks whether the replay may run; on success returns the number of
    /// throughput samples the server wants per replay.
    pub async fn ask4_permission(&mut self) -> Result<u32> {
        let reply = self.round_trip(Opcode::Ask4Permission, "").await?;
        parse_permission(&reply)
    }

    /// Requests an additional replay within the running test. Returns the
    /// samples-per-replay grant, same grammar as `ask4_permission`.
    pub async fn declare_replay(
        &mut self,
        replay_id: u32,
        replay_name: &str,
        is_last_replay: bool,
    ) -> Result<u32> {
        let message = format!("{replay_id};{replay_name};{}", title_bool(is_last_replay));
        let reply = self.round_trip(Opcode::DeclareReplay, &message).await?;
        parse_permission(&reply)
    }

    /// Reports the replay duration and the sampled throughput series.
    pub async fn send_throughputs(
        &mut self,
        replay_duration: Duration,
        throughputs: &[f64],
        sample_times: &[f64],
    ) -> Result<String> {
        let series = serde_json::to_string(&[throughputs, sample_times])?;
        let body = format!("{};{series}", replay_duration.as_secs_f64());
        self.round_trip(Opcode::Throughputs, &body).await?.into_ok()
    }

    /// Asks the server to run the KS-2 analysis over both replays.
    pub async fn analyze_test(&mut self) -> Result<KS2Result> {
        let body = self.round_trip(Opcode::AnalyzeTest, "").await?.into_ok()?;
        serde_json::from_str(&body)
            .map_err(|e| Error::ProtocolMismatch(format!("bad KS2 result {body:?}: {e}")))
    }

    async fn round_trip(&mut self, opcode: Opcode, body: &str) -> Result<Reply> {
        self.send_request(opcode, body).await?;
        self.read_reply().await
    }

    async fn send_request(&mut self, opcode: Opcode, body: &str) -> Result<()> {
        if body.len() > MAX_REQUEST_BODY {
            return Err(Error::SideChannel(format!(
                "request body of {} bytes exceeds the 24-bit length field",
                body.len()
            )));
        }
        debug!(id = self.id, ?opcode, body, "side channel request");

        let header = ((opcode as u32) << 24) | body.len() as u32;
        self.stream
            .write_all(&header.to_be_bytes())
            .await
            .map_err(|e| Error::SideChannel(format!("send header: {e}")))?;
        self.stream
            .write_all(body.as_bytes())
            .await
            .map_err(|e| Error::SideChannel(format!("send body: {e}")))?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Error::SideChannel(format!("read length: {e}")))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(Error::ProtocolMismatch("empty response frame".into()));
        }

        let mut frame = vec![0u8; len];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| Error::SideChannel(format!("read body: {e}")))?;

        let code = frame[0];
        let body = String::from_utf8(frame.split_off(1))
            .map_err(|e| Error::ProtocolMismatch(format!("response not UTF-8: {e}")))?;
        debug!(id = self.id, code, body, "side channel reply");
        Ok(Reply { code, body })
    }
}

/// Parses the shared `Ask4Permission` / `DeclareReplay` grammar:
/// `"0;<samplesPerReplay>"` on success, `"1;<code>"` on denial.
fn parse_permission(reply: &Reply) -> Result<u32> {
    let fields: Vec<&str> = reply.body.split(';').collect();
    if fields.len() < 2 {
        return Err(Error::ProtocolMismatch(format!(
            "improperly formatted permission: {:?}",
            reply.body
        )));
    }
    match fields[0] {
        "0" => fields[1].parse().map_err(|_| {
            Error::ProtocolMismatch(format!("bad samples-per-replay: {:?}", fields[1]))
        }),
        "1" => Err(PermissionError::from_code(fields[1]).into()),
        status => Err(Error::ProtocolMismatch(format!(
            "unknown permission status: {status:?}"
        ))),
    }
}

/// Title-cased boolean literals, as the server expects.
fn title_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u8, body: &str) -> Reply {
        Reply {
            code,
            body: body.to_string(),
        }
    }

    #[test]
    fn permission_grant_yields_sample_count() {
        assert_eq!(parse_permission(&reply(OK_RESPONSE, "0;10")).unwrap(), 10);
    }

    #[test]
    fn permission_denials_map_to_reasons() {
        let cases = [
            ("1", PermissionError::UnknownReplay),
            ("2", PermissionError::IpInUse),
            ("3", PermissionError::LowResources),
            ("4", PermissionError::ResourceLookupFailed),
        ];
        for (code, expected) in cases {
            let err = parse_permission(&reply(ERROR_RESPONSE, &format!("1;{code}"))).unwrap_err();
            match err {
                Error::PermissionDenied(reason) => assert_eq!(reason, expected),
                other => panic!("expected PermissionDenied, got {other:?}"),
            }
        }
    }

    #[test]
    fn short_permission_reply_is_a_protocol_mismatch() {
        let err = parse_permission(&reply(OK_RESPONSE, "0")).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
    }

    #[test]
    fn booleans_are_title_cased() {
        assert_eq!(title_bool(true), "True");
        assert_eq!(title_bool(false), "False");
    }
}
