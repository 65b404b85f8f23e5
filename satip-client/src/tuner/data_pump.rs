//! Pull delivery: a dedicated task moves RTP data into the device sink.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::tuner::controller::{TunerShared, RTP_BUFFER_SIZE};

/// Back-off while the sink has no room for a full datagram.
const SINK_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) async fn run(shared: Arc<TunerShared>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    debug!("[device {}] data pump started", shared.index);
    let mut buf = vec![0u8; RTP_BUFFER_SIZE];

    loop {
        let room = shared.sink.check_data();
        if room < buf.len() {
            trace!("[device {}] sink full ({} bytes free)", shared.index, room);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SINK_BACKOFF) => continue,
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(len) => {
                    shared.receive(&buf[..len]);
                }
                Err(e) => {
                    debug!("[device {}] RTP receive failed: {}", shared.index, e);
                    tokio::time::sleep(SINK_BACKOFF).await;
                }
            },
        }
    }
    debug!("[device {}] data pump stopped", shared.index);
}
