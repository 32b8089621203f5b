//! JSON line protocol for the bridge ↔ remote-peer link, plus the detector
//! feed format consumed on stdin.
//!
//! Self-contained: no imports from other anchor_bridge modules.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

// --- Geometry payloads ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn from_array(p: [f64; 3]) -> Self {
        Self {
            x: p[0],
            y: p[1],
            z: p[2],
        }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quat {
    pub fn from_array(q: [f64; 4]) -> Self {
        Self {
            x: q[0],
            y: q[1],
            z: q[2],
            w: q[3],
        }
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

// --- Message types ---

/// Remote peer → bridge. One anchor list per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorList {
    #[serde(rename = "listOfAnchors")]
    pub list_of_anchors: Vec<Anchor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub id: u32,
    pub position: Vec3,
}

/// Bridge → remote peer. Empty list when there is nothing to report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformedAnchors {
    #[serde(rename = "transformedAnchors")]
    pub transformed_anchors: Vec<TransformedAnchor>,
}

impl TransformedAnchors {
    pub fn empty() -> Self {
        Self {
            transformed_anchors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformedAnchor {
    pub anchor_id: u32,
    pub original_position: Vec3,
    pub transformed_position: Vec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Quat>,
}

/// Detector process → bridge (stdin, one JSON object per line).
///
/// `corners` carries the four marker corners in detection order
/// (top-left, top-right, bottom-right, bottom-left) when all four
/// had valid depth; the bridge derives orientation from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub markers: Vec<MarkerDetection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerDetection {
    pub id: u32,
    pub position: Vec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corners: Option<[Vec3; 4]>,
}

// --- TCP codec helpers ---

/// The peer sends compact single-line JSON; 64KB leaves ample headroom.
const MAX_LINE_BYTES: usize = 64 * 1024;

pub type MessageStream = Framed<TcpStream, LinesCodec>;

/// Create a framed message stream with newline-delimited JSON framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
}

/// Serialize and send one message as a JSON line.
pub async fn send_message<T: Serialize>(stream: &mut MessageStream, msg: &T) -> Result<()> {
    let line = serde_json::to_string(msg)?;
    stream.send(line).await?;
    Ok(())
}

/// One received payload. A line that is not valid JSON for `T` is a
/// per-cycle condition, not a stream failure.
#[derive(Debug)]
pub enum Inbound<T> {
    Message(T),
    Malformed {
        error: serde_json::Error,
        line: String,
    },
}

/// Receive one line and try to decode it.
///
/// Errors are fatal stream conditions (closed connection, oversized line);
/// undecodable payloads come back as `Inbound::Malformed`.
pub async fn recv_inbound<T: DeserializeOwned>(stream: &mut MessageStream) -> Result<Inbound<T>> {
    match stream.next().await {
        Some(Ok(line)) => match serde_json::from_str(&line) {
            Ok(msg) => Ok(Inbound::Message(msg)),
            Err(error) => Ok(Inbound::Malformed { error, line }),
        },
        Some(Err(e)) => Err(e.into()),
        None => Err(anyhow::anyhow!("connection closed")),
    }
}
