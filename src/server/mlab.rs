//! MLab locator interaction.
//!
//! The client asks the public locator for the nearest machines serving the
//! wehe replay service, then connects to each candidate in order: DNS
//! resolution, then the short-lived admission WebSocket (valid for about
//! two minutes and kept open for the test's duration). Connecting stops
//! once the requested number of servers is up; a shortfall fails the run.

use serde::Deserialize;
use tracing::{info, warn};

use super::{http_get, Server};
use crate::error::{Error, Result};

/// Locator endpoint for the wehe replay service.
pub const LOCATOR_URL: &str = "https://locate.measurementlab.net/v2/nearest/wehe/replay";

#[derive(Debug, Deserialize)]
struct LocateResponse {
    results: Vec<LocateResult>,
}

#[derive(Debug, Deserialize)]
struct LocateResult {
    machine: String,
    urls: LocateUrls,
}

#[derive(Debug, Deserialize)]
struct LocateUrls {
    /// The locator keys the access URL by its URL template.
    #[serde(rename = "wss://:4443/v0/envelope/access")]
    access: String,
}

/// One machine the locator offered: the replay hostname to resolve and
/// the WebSocket URL granting admission to it.
#[derive(Debug, Clone)]
pub struct MLabServer {
    pub hostname: String,
    pub access_url: String,
}

/// Fetches the candidate machines from the locator.
pub async fn fetch_mlab_servers() -> Result<Vec<MLabServer>> {
    let body = http_get(LOCATOR_URL).await?;
    parse_locate_response(&body)
}

fn parse_locate_response(body: &str) -> Result<Vec<MLabServer>> {
    let response: LocateResponse = serde_json::from_str(body)
        .map_err(|e| Error::ProtocolMismatch(format!("bad locator response: {e}")))?;
    Ok(response
        .results
        .into_iter()
        .map(|result| MLabServer {
            hostname: format!("wehe-{}", result.machine),
            access_url: result.urls.access,
        })
        .collect())
}

/// Connects to locator candidates in order until `num_servers` servers are
/// up. Every candidate failure is collected; a shortfall fails hard with
/// all of them — the command-line client exists to test MLab connectivity
/// and does not fall back.
pub async fn connect_servers(num_servers: usize) -> Result<Vec<Server>> {
    let candidates = fetch_mlab_servers().await?;

    let mut servers: Vec<Server> = Vec::with_capacity(num_servers);
    let mut errors = Vec::new();
    let mut tries: u32 = 0;
    for candidate in candidates {
        if servers.len() == num_servers {
            break;
        }
        tries += 1;

        let mut server = match Server::new(&candidate.hostname).await {
            Ok(server) => server,
            Err(err) => {
                warn!(hostname = %candidate.hostname, %err, "failed to initialize MLab server");
                errors.push(format!(
                    "error initializing server {}: {err}",
                    candidate.hostname
                ));
                continue;
            }
        };
        if let Err(err) = server.open_websocket(&candidate.access_url).await {
            warn!(hostname = %candidate.hostname, %err, "failed to open MLab websocket");
            errors.push(format!(
                "error connecting to {} websocket: {err}",
                candidate.hostname
            ));
            continue;
        }

        server.num_mlab_tries = tries;
        info!(hostname = %server.hostname, tries, "MLab server connected");
        servers.push(server);
    }

    if servers.len() != num_servers {
        return Err(Error::MLabUnavailable {
            connected: servers.len(),
            wanted: num_servers,
            errors,
        });
    }
    Ok(servers)
}
