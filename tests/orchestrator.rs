//! End-to-end orchestrator tests against scripted loopback servers: a
//! side-channel script plus a replay listener that also answers the
//! public-IP probe.

use std::io::Write;
use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use wehe::config::{Config, LogLevel};
use wehe::error::{Error, PermissionError};
use wehe::orchestrator::{ReplayType, Status, TestOrchestrator};
use wehe::server::Server;
use wehe::testdata::Test;

const KS2_NO_DIFF: &str = r#"{"Area0var": 0.1, "KS2pVal": 0.5,
    "OriginalAvgThroughput": 3.0, "RandomAvgThroughput": 2.9}"#;

// ============================================================================
// Scripted servers
// ============================================================================

/// Side-channel server: answers the orchestrator's request sequence until
/// the client hangs up. Permission replies come from `permission`.
async fn run_side_channel(listener: TcpListener, permission: (u8, &'static str)) {
    let (mut stream, _) = listener.accept().await.unwrap();
    loop {
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).await.is_err() {
            return; // client closed; test over
        }
        let opcode = header[0];
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();

        let reply: Option<(u8, String)> = match opcode {
            0x31 => None, // ReceiveID has no ack
            0x32 | 0x35 => Some((permission.0, permission.1.to_string())),
            0x34 => Some((0x00, "ok".to_string())),
            0x36 => Some((0x00, KS2_NO_DIFF.to_string())),
            other => panic!("unexpected opcode {other:#04x}"),
        };
        if let Some((code, body)) = reply {
            let frame_len = (1 + body.len()) as u32;
            stream.write_all(&frame_len.to_be_bytes()).await.unwrap();
            stream.write_all(&[code]).await.unwrap();
            stream.write_all(body.as_bytes()).await.unwrap();
        }
    }
}

/// Replay-port server: serves the `WHATSMYIPMAN` probe over HTTP and plays
/// the server half of each TCP replay (read the trace, answer with a burst,
/// close).
async fn run_replay_port(listener: TcpListener, expected_replay_bytes: usize) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let Ok(n) = stream.read(&mut buf).await else {
                return;
            };
            if buf[..n].starts_with(b"GET ") {
                let body = "127.0.0.1";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                return;
            }
            let mut total = n;
            while total < expected_replay_bytes {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => total += n,
                }
            }
            let _ = stream.write_all(&vec![0u8; 8192]).await;
            // closing ends the replay on the client side
        });
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Writes a small TCP trace targeting `replay_port`; both packets land
/// within the first quarter second.
fn write_trace(dir: &std::path::Path, file_name: &str, replay_port: u16, payload_hex: &str) {
    let trace = format!(
        r#"[
            [
                {{"c_s_pair": "127.0.0.1.40000-127.0.0.1.{replay_port:05}",
                  "timestamp": 0.0, "payload": "{payload_hex}",
                  "response_len": 16, "response_hash": ""}},
                {{"c_s_pair": "127.0.0.1.40000-127.0.0.1.{replay_port:05}",
                  "timestamp": 0.1, "payload": "{payload_hex}",
                  "response_len": 0, "response_hash": null}}
            ],
            ["40000"],
            ["127.0.0.1.40000-127.0.0.1.{replay_port:05}"],
            "Netflix-12122018"
        ]"#
    );
    let mut file = std::fs::File::create(dir.join(file_name)).unwrap();
    file.write_all(trace.as_bytes()).unwrap();
}

fn test_config(tests_dir: &std::path::Path) -> Config {
    Config {
        test_names: vec!["netflix".to_string()],
        server_display: "127.0.0.1".to_string(),
        num_servers: 1,
        extra_string: "DiffDetector".to_string(),
        send_mobile_stats: false,
        result: true,
        confirmation_replays: false,
        use_default_thresholds: true,
        area_threshold: 50,
        ks2pvalue_threshold: 1,
        log_level: LogLevel::Error,
        user_config_file: "unused".to_string(),
        tests_config_file: "unused".to_string(),
        server_cert_file: "unused".to_string(),
        tests_dir: tests_dir.to_string_lossy().into_owned(),
        results_ui_dir: "unused".to_string(),
        results_log_dir: "unused".to_string(),
        info_file: "unused".to_string(),
    }
}

fn loopback_server(side_channel_port: u16) -> Server {
    Server {
        hostname: "127.0.0.1".to_string(),
        ip: IpAddr::from([127, 0, 0, 1]),
        side_channel_port,
        side_channel: None,
        websocket: None,
        num_mlab_tries: 0,
        last_replay: None,
    }
}

fn netflix_test() -> Test {
    Test {
        name: "Netflix".to_string(),
        time: 2,
        image: "netflix".to_string(),
        datafile: "netflix.json".to_string(),
        randomdatafile: "netflix_random.json".to_string(),
        original_throughput: 0.0,
        random_throughput: 0.0,
        test_id: 1,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn two_replay_tcp_test_reaches_a_verdict() {
    let side_channel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let side_channel_port = side_channel_listener.local_addr().unwrap().port();
    let replay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let replay_port = replay_listener.local_addr().unwrap().port();

    let side_channel = tokio::spawn(run_side_channel(side_channel_listener, (0x00, "0;10")));
    // each replay sends two 4-byte payloads
    let replay_server = tokio::spawn(run_replay_port(replay_listener, 8));

    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), "netflix.json", replay_port, "deadbeef");
    write_trace(dir.path(), "netflix_random.json", replay_port, "cafef00d");

    let cfg = test_config(dir.path());
    let mut test = netflix_test();
    let mut servers = vec![loopback_server(side_channel_port)];

    let mut orchestrator = TestOrchestrator::new(
        &mut test,
        [ReplayType::Original, ReplayType::Random],
        &cfg,
        &mut servers,
    );
    let results = orchestrator.run("@abc123XYZ", "0.3.0").await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, Status::NoDifferentiation);
    assert_eq!(results[0].server_hostname, "127.0.0.1");
    assert!((results[0].ks2_result.original_avg_throughput - 3.0).abs() < 1e-9);
    // thresholds stayed at their configured values (low bandwidth)
    assert!((results[0].area_threshold - 0.5).abs() < f64::EPSILON);
    assert!((results[0].ks2_p_value_threshold - 0.01).abs() < f64::EPSILON);

    // cleanup dropped the side channel; the scripted server sees EOF
    side_channel.await.unwrap();
    replay_server.abort();
}

#[tokio::test]
async fn permission_denial_fails_the_test_and_cleans_up() {
    let side_channel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let side_channel_port = side_channel_listener.local_addr().unwrap().port();
    let replay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let replay_port = replay_listener.local_addr().unwrap().port();

    // ip-in-use denial on Ask4Permission
    let side_channel = tokio::spawn(run_side_channel(side_channel_listener, (0x01, "1;2")));
    let replay_server = tokio::spawn(run_replay_port(replay_listener, usize::MAX));

    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), "netflix.json", replay_port, "deadbeef");
    write_trace(dir.path(), "netflix_random.json", replay_port, "cafef00d");

    let cfg = test_config(dir.path());
    let mut test = netflix_test();
    let mut servers = vec![loopback_server(side_channel_port)];

    let mut orchestrator = TestOrchestrator::new(
        &mut test,
        [ReplayType::Original, ReplayType::Random],
        &cfg,
        &mut servers,
    );
    let err = orchestrator.run("@abc123XYZ", "0.3.0").await.unwrap_err();

    match err {
        Error::PermissionDenied(reason) => assert_eq!(reason, PermissionError::IpInUse),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
    // the orchestrator released the side channel on the failure path
    assert!(servers[0].side_channel.is_none());

    side_channel.await.unwrap();
    replay_server.abort();
}

#[tokio::test]
async fn missing_trace_fails_before_any_connection() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut test = netflix_test();
    let mut servers = vec![loopback_server(1)];

    let mut orchestrator = TestOrchestrator::new(
        &mut test,
        [ReplayType::Original, ReplayType::Random],
        &cfg,
        &mut servers,
    );
    let err = orchestrator.run("@abc123XYZ", "0.3.0").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTrace(_)));
}
