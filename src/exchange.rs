//! Reusable receive → process → reply loop for a bridge session.
//!
//! Every session follows the same shape: receive one anchor list, hand it to a
//! per-cycle callback together with whatever local state the caller closes
//! over, send the reply, pace, repeat. The callback sees malformed payloads as
//! an explicit `Inbound::Malformed` value so it can log and skip the cycle;
//! only stream-level failures (connection closed, oversized line) end the
//! session by propagating out of `run`.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;

use crate::protocol::{self, AnchorList, Inbound, TransformedAnchors};

/// Per-cycle verdict from the session callback.
#[derive(Debug)]
pub enum Cycle {
    /// Send this reply and continue with the next cycle.
    Reply(TransformedAnchors),
    /// Nothing to send this cycle (e.g. the inbound payload was unusable).
    Skip,
}

pub struct ExchangeLoop {
    addr: String,
    cycle_interval: Duration,
}

impl ExchangeLoop {
    pub fn new(addr: impl Into<String>, cycle_interval: Duration) -> Self {
        Self {
            addr: addr.into(),
            cycle_interval,
        }
    }

    /// Connect to the peer and run the session until the stream fails.
    ///
    /// There is no reconnect: the calibration transform is fitted once per
    /// session, so a silently resumed connection would keep tracking against
    /// a stale fit. A dead session is surfaced to the caller instead.
    pub async fn run<F>(&self, mut on_cycle: F) -> Result<()>
    where
        F: FnMut(Inbound<AnchorList>) -> Cycle,
    {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        tcp.set_nodelay(true)?;
        let mut stream = protocol::message_stream(tcp);

        loop {
            let inbound = protocol::recv_inbound::<AnchorList>(&mut stream).await?;
            match on_cycle(inbound) {
                Cycle::Reply(reply) => {
                    protocol::send_message(&mut stream, &reply).await?;
                }
                Cycle::Skip => {}
            }
            tokio::time::sleep(self.cycle_interval).await;
        }
    }
}
