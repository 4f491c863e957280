//! Side-channel protocol tests - validates framing and reply grammar
//! against a scripted loopback server.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wehe::error::{Error, PermissionError};
use wehe::network::SideChannel;

// ============================================================================
// Scripted server helpers
// ============================================================================

/// Reads one request frame: opcode byte + 24-bit big-endian length + body.
async fn read_request(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let opcode = header[0];
    let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    (opcode, body)
}

/// Writes one response frame: 32-bit big-endian length, response code, body.
async fn write_reply(stream: &mut TcpStream, code: u8, body: &[u8]) {
    let len = (1 + body.len()) as u32;
    stream.write_all(&len.to_be_bytes()).await.unwrap();
    stream.write_all(&[code]).await.unwrap();
    stream.write_all(body).await.unwrap();
}

async fn connect_pair(listener: &TcpListener) -> (SideChannel, TcpStream) {
    let port = listener.local_addr().unwrap().port();
    let (channel, accepted) = tokio::join!(
        SideChannel::connect(0, "127.0.0.1".parse().unwrap(), port),
        listener.accept(),
    );
    let (server_side, _) = accepted.unwrap();
    (channel.unwrap(), server_side)
}

// ============================================================================
// Frame integrity (request side)
// ============================================================================

#[tokio::test]
async fn declare_replay_frames_exactly_the_declared_length() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    let server = tokio::spawn(async move {
        let (opcode, body) = read_request(&mut server_side).await;
        assert_eq!(opcode, 0x35);
        // the body must be exactly the declared length, nothing more queued
        assert_eq!(body, b"1;Netflix-12122018;True");
        write_reply(&mut server_side, 0x00, b"0;10").await;
    });

    let samples = channel
        .declare_replay(1, "Netflix-12122018", true)
        .await
        .unwrap();
    assert_eq!(samples, 10);
    server.await.unwrap();
}

#[tokio::test]
async fn receive_id_carries_all_eight_fields_and_gets_no_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    let server = tokio::spawn(async move {
        let (opcode, body) = read_request(&mut server_side).await;
        assert_eq!(opcode, 0x31);
        let body = String::from_utf8(body).unwrap();
        let fields: Vec<&str> = body.split(';').collect();
        assert_eq!(
            fields,
            vec!["@abc123XYZ", "0", "Netflix-12122018", "2", "7", "False", "203.0.113.9", "0.3.0"]
        );

        // the next request must start on a clean frame boundary
        let (opcode, body) = read_request(&mut server_side).await;
        assert_eq!(opcode, 0x32);
        assert!(body.is_empty());
        write_reply(&mut server_side, 0x00, b"0;20").await;
    });

    channel
        .send_id("@abc123XYZ", 0, "Netflix-12122018", 2, 7, false, "203.0.113.9", "0.3.0")
        .await
        .unwrap();
    let samples = channel.ask4_permission().await.unwrap();
    assert_eq!(samples, 20);
    server.await.unwrap();
}

#[tokio::test]
async fn throughputs_body_is_duration_then_series() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    let server = tokio::spawn(async move {
        let (opcode, body) = read_request(&mut server_side).await;
        assert_eq!(opcode, 0x34);
        let body = String::from_utf8(body).unwrap();
        let (duration, series) = body.split_once(';').unwrap();
        assert!((duration.parse::<f64>().unwrap() - 12.5).abs() < 1e-9);
        let series: Vec<Vec<f64>> = serde_json::from_str(series).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0], vec![2.0, 1.5]);
        assert_eq!(series[1], vec![0.5, 1.0]);
        write_reply(&mut server_side, 0x00, b"ok").await;
    });

    let reply = channel
        .send_throughputs(
            std::time::Duration::from_secs_f64(12.5),
            &[2.0, 1.5],
            &[0.5, 1.0],
        )
        .await
        .unwrap();
    assert_eq!(reply, "ok");
    server.await.unwrap();
}

// ============================================================================
// Reply grammar
// ============================================================================

#[tokio::test]
async fn permission_denial_surfaces_the_reason() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    tokio::spawn(async move {
        let _ = read_request(&mut server_side).await;
        // error response code with the ip-in-use denial body
        write_reply(&mut server_side, 0x01, b"1;2").await;
    });

    let err = channel.ask4_permission().await.unwrap_err();
    match err {
        Error::PermissionDenied(reason) => assert_eq!(reason, PermissionError::IpInUse),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_permission_reply_is_a_protocol_mismatch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    tokio::spawn(async move {
        let _ = read_request(&mut server_side).await;
        write_reply(&mut server_side, 0x00, b"banana").await;
    });

    let err = channel.ask4_permission().await.unwrap_err();
    assert!(matches!(err, Error::ProtocolMismatch(_)));
}

#[tokio::test]
async fn analyze_test_parses_the_ks2_result() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    tokio::spawn(async move {
        let (opcode, _) = read_request(&mut server_side).await;
        assert_eq!(opcode, 0x36);
        write_reply(
            &mut server_side,
            0x00,
            br#"{"Area0var": 0.7, "KS2pVal": 0.001,
                "OriginalAvgThroughput": 2.0, "RandomAvgThroughput": 0.5}"#,
        )
        .await;
    });

    let ks2 = channel.analyze_test().await.unwrap();
    assert!((ks2.area0_var - 0.7).abs() < 1e-9);
    assert!((ks2.ks2_p_val - 0.001).abs() < 1e-9);
    assert!((ks2.original_avg_throughput - 2.0).abs() < 1e-9);
    assert!((ks2.random_avg_throughput - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn generic_server_error_is_a_side_channel_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut channel, mut server_side) = connect_pair(&listener).await;

    tokio::spawn(async move {
        let _ = read_request(&mut server_side).await;
        // error code, empty body: generic failure
        write_reply(&mut server_side, 0x01, b"").await;
    });

    let err = channel.analyze_test().await.unwrap_err();
    assert!(matches!(err, Error::SideChannel(_)));
}
