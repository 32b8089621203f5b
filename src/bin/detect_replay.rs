//! Replays a JSONL file of detector frames to stdout at a fixed rate, for
//! driving the bridge without a camera:
//!
//!   detect_replay frames.jsonl 100 | anchor-bridge

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use anchor_bridge::protocol::DetectionFrame;

const DEFAULT_INTERVAL_MS: u64 = 200;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        bail!("usage: {} <frames.jsonl> [interval_ms]", args[0]);
    }
    let path = &args[1];
    let interval_ms: u64 = match args.get(2) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid interval: {}", arg))?,
        None => DEFAULT_INTERVAL_MS,
    };
    let interval = Duration::from_millis(interval_ms);

    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path))?;
    let reader = BufReader::new(file);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut sent = 0usize;
    let mut skipped = 0usize;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // 壊れた行は再生せず警告のみ（ブリッジ側のパーサを汚さない）
        if let Err(e) = serde_json::from_str::<DetectionFrame>(trimmed) {
            eprintln!("[replay] line {}: not a detection frame: {}", lineno + 1, e);
            skipped += 1;
            continue;
        }
        writeln!(out, "{}", trimmed)?;
        out.flush()?;
        sent += 1;
        std::thread::sleep(interval);
    }

    eprintln!(
        "[replay] done: {} frames sent, {} skipped ({}ms interval)",
        sent, skipped, interval_ms
    );
    Ok(())
}
