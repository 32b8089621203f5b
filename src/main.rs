//! Anchor bridge: aligns a depth camera's marker observations with a remote
//! device's spatial anchors, then streams the transformed set back over TCP.
//!
//! Local marker detections arrive as JSON lines on stdin (one frame per
//! line, produced by an external detector process); anchor lists arrive from
//! the remote peer over TCP. Calibration is fitted once per session.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncBufReadExt;

use anchor_bridge::calibration::FitOutcome;
use anchor_bridge::config::Config;
use anchor_bridge::exchange::{Cycle, ExchangeLoop};
use anchor_bridge::observation::{ObservationSet, ObservationSlot, TrackedPoint};
use anchor_bridge::protocol::{DetectionFrame, Inbound, TransformedAnchors};
use anchor_bridge::tracker::{rotation_from_corners, CycleOutput, Estimator};

const CONFIG_PATH: &str = "bridge.toml";

/// Log tracking summaries every N cycles (~5s at the default cycle interval).
const TRACK_LOG_EVERY: u64 = 25;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

type LogFile = Arc<Mutex<std::io::BufWriter<std::fs::File>>>;

fn open_log_file() -> Result<LogFile> {
    std::fs::create_dir_all("logs")?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = format!("logs/bridge_{}.log", ts);
    let file = std::fs::File::create(&path)?;
    eprintln!("Log: {}", path);
    Ok(Arc::new(Mutex::new(std::io::BufWriter::new(file))))
}

macro_rules! log {
    ($logfile:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        eprintln!("{}", msg);
        if let Ok(mut f) = $logfile.lock() {
            let _ = writeln!(f, "{}", msg);
            let _ = f.flush();
        }
    }};
}

// ---------------------------------------------------------------------------
// Detector feed (stdin → observation slot)
// ---------------------------------------------------------------------------

fn detection_to_observations(frame: DetectionFrame) -> ObservationSet {
    let mut set = ObservationSet::new();
    for marker in frame.markers {
        let rotation = marker
            .corners
            .map(|c| {
                [
                    c[0].to_array(),
                    c[1].to_array(),
                    c[2].to_array(),
                    c[3].to_array(),
                ]
            })
            .and_then(|corners| rotation_from_corners(&corners));
        set.insert(
            marker.id,
            TrackedPoint {
                id: marker.id,
                position: marker.position.to_array(),
                rotation,
            },
        );
    }
    set
}

async fn stdin_feed_loop(slot: Arc<ObservationSlot>, logfile: LogFile) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<DetectionFrame>(trimmed) {
            Ok(frame) => slot.publish(detection_to_observations(frame)),
            Err(e) => {
                // A bad frame only loses that frame; the previous snapshot stays live
                log!(logfile, "[feed] malformed detection frame: {}", e);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default(CONFIG_PATH);
    let logfile = open_log_file()?;
    log!(logfile, "Anchor Bridge ({})", env!("GIT_VERSION"));
    log!(
        logfile,
        "[config] peer={}, cycle_interval={}ms, min_correspondences={}, max_residual={}, smoothing={} (window {})",
        config.server.addr,
        config.server.cycle_interval_ms,
        config.calibration.min_correspondences,
        config.calibration.max_residual,
        if config.smoothing.enabled { "on" } else { "off" },
        config.smoothing.window_size,
    );

    let slot = Arc::new(ObservationSlot::new());

    // Detector feed task: stdin frames → latest-observation slot
    {
        let slot = Arc::clone(&slot);
        let feed_logfile = logfile.clone();
        tokio::spawn(async move {
            match stdin_feed_loop(slot, feed_logfile.clone()).await {
                Ok(()) => log!(feed_logfile, "[feed] detector stream ended"),
                Err(e) => log!(feed_logfile, "[feed] detector stream failed: {}", e),
            }
        });
    }

    // SIGUSR1 → dump estimator state on the next cycle
    let dump_state = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&dump_state))?;

    let mut estimator = Estimator::from_config(&config.calibration, &config.smoothing);
    let exchange = ExchangeLoop::new(
        config.server.addr.clone(),
        Duration::from_millis(config.server.cycle_interval_ms),
    );

    log!(logfile, "[tcp] connecting to {}...", config.server.addr);

    let mut cycle_count: u64 = 0;
    let result = exchange
        .run(|inbound| {
            if dump_state.swap(false, Ordering::Relaxed) {
                log!(
                    logfile,
                    "[state] {:?}, smoothed markers: {}, feed generation: {}",
                    estimator.state(),
                    estimator.smoothed_marker_count(),
                    slot.generation(),
                );
                if let Some(t) = estimator.transform() {
                    log!(logfile, "[state] transform:\n{}", t.matrix());
                }
            }

            let msg = match inbound {
                Inbound::Message(msg) => msg,
                Inbound::Malformed { error, .. } => {
                    log!(logfile, "[tcp] malformed anchor list, skipping cycle: {}", error);
                    return Cycle::Skip;
                }
            };

            let reference: Vec<(u32, [f64; 3])> = msg
                .list_of_anchors
                .iter()
                .map(|a| (a.id, a.position.to_array()))
                .collect();
            let observations = slot.snapshot();

            cycle_count += 1;
            match estimator.process_cycle(&reference, &observations) {
                CycleOutput::Calibrating(outcome) => {
                    match outcome {
                        FitOutcome::MissingIds(ids) => {
                            log!(logfile, "[cal] waiting: anchor ids {:?} not yet observed", ids);
                        }
                        FitOutcome::TooFewCorrespondences { have, need } => {
                            log!(logfile, "[cal] waiting: {} correspondences, need {}", have, need);
                        }
                        FitOutcome::Degenerate { rank } => {
                            log!(logfile, "[cal] rejected: degenerate correspondences (rank {})", rank);
                        }
                        FitOutcome::ResidualTooLarge { residual, limit } => {
                            log!(
                                logfile,
                                "[cal] rejected: residual {:.6} exceeds {:.6}",
                                residual,
                                limit
                            );
                        }
                        FitOutcome::Fitted { .. } => unreachable!("fit success is CycleOutput::Calibrated"),
                    }
                    Cycle::Reply(TransformedAnchors::empty())
                }
                CycleOutput::Calibrated { residual, anchors } => {
                    log!(
                        logfile,
                        "[cal] transform fitted from {} correspondences (residual {:.6})",
                        anchors.len(),
                        residual
                    );
                    if let Some(t) = estimator.transform() {
                        log!(logfile, "[cal] transform:\n{}", t.matrix());
                    }
                    Cycle::Reply(TransformedAnchors {
                        transformed_anchors: anchors,
                    })
                }
                CycleOutput::Tracked(anchors) => {
                    if cycle_count % TRACK_LOG_EVERY == 0 {
                        log!(
                            logfile,
                            "[track] cycle {}: {} visible markers",
                            cycle_count,
                            anchors.len()
                        );
                    }
                    Cycle::Reply(TransformedAnchors {
                        transformed_anchors: anchors,
                    })
                }
            }
        })
        .await;

    // One fit per session: no automatic reconnect, restart manually
    if let Err(ref e) = result {
        log!(logfile, "[tcp] session ended: {:#}", e);
    }
    result
}
