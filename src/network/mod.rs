//! Data-plane replay clients and the side-channel control protocol.

use std::time::Duration;

pub mod sidechannel;
pub mod tcp;
pub mod udp;

pub use sidechannel::{Opcode, SideChannel, SIDE_CHANNEL_PORT};
pub use tcp::TcpReplayClient;
pub use udp::UdpReplayClient;

/// Wall-clock cap on a timed replay so the user never waits forever.
pub const REPLAY_TIMEOUT: Duration = Duration::from_secs(45);

/// Port tests send back-to-back and finish sooner.
pub const PORT_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline bounding every blocking receive so a cancelled peer is
/// observed within one deadline.
pub const READ_DEADLINE: Duration = Duration::from_secs(1);

pub(crate) const RECV_BUFFER_SIZE: usize = 4096;

/// Replay cap for a given pacing mode; `timing == false` is a port test.
pub(crate) fn replay_timeout(timing: bool) -> Duration {
    if timing {
        REPLAY_TIMEOUT
    } else {
        PORT_TEST_TIMEOUT
    }
}
