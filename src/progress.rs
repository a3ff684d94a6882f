use std::time::{Duration, Instant};

use serde::Serialize;

/// Minimum spacing between two progress callbacks of one stage.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

const SPEED_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub bytes_read: u64,
    pub bytes_total: Option<u64>,
    pub percent: Option<f64>,
    pub bytes_per_sec: f64,
}

impl TransferProgress {
    pub fn new(bytes_read: u64, bytes_total: Option<u64>, bytes_per_sec: f64) -> Self {
        Self {
            bytes_read,
            bytes_total,
            percent: percent(bytes_read, bytes_total),
            bytes_per_sec,
        }
    }

    pub fn label(&self) -> String {
        let speed = format!("{}/s", human_bytes(self.bytes_per_sec as u64));
        match self.bytes_total {
            Some(total) => format!(
                "{}/{} ({speed})",
                human_bytes(self.bytes_read),
                human_bytes(total)
            ),
            None => format!("{} ({speed})", human_bytes(self.bytes_read)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HashProgress {
    pub bytes_hashed: u64,
    pub bytes_total: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionProgress {
    /// Bytes consumed from the compressed stream; only the compressed size
    /// is known up front.
    pub compressed_read: u64,
    pub compressed_total: u64,
    pub percent: f64,
    pub label: String,
}

impl ExtractionProgress {
    pub fn new(compressed_read: u64, compressed_total: u64) -> Self {
        Self {
            compressed_read,
            compressed_total,
            percent: percent(compressed_read, Some(compressed_total)).unwrap_or(0.0),
            label: format!(
                "{}/{}",
                human_bytes(compressed_read),
                human_bytes(compressed_total)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum ProgressUpdate {
    Transfer(TransferProgress),
    Verify(HashProgress),
    Extract(ExtractionProgress),
}

impl ProgressUpdate {
    pub fn percent(&self) -> Option<f64> {
        match self {
            ProgressUpdate::Transfer(progress) => progress.percent,
            ProgressUpdate::Verify(progress) => Some(progress.percent),
            ProgressUpdate::Extract(progress) => Some(progress.percent),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ProgressUpdate::Transfer(progress) => progress.label(),
            ProgressUpdate::Verify(progress) => format!(
                "checksum {}/{}",
                human_bytes(progress.bytes_hashed),
                human_bytes(progress.bytes_total)
            ),
            ProgressUpdate::Extract(progress) => format!("extracting {}", progress.label),
        }
    }
}

/// `100 * done / total` clamped to `[0, 100]`; `None` when the total is unknown.
pub fn percent(done: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => {
            Some((100.0 * done as f64 / total as f64).clamp(0.0, 100.0))
        }
        _ => None,
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Gate that opens at most once per interval. The first call always passes.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

/// Instantaneous speed over a one second sliding window.
#[derive(Debug)]
pub struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    bytes_per_sec: f64,
}

impl SpeedMeter {
    pub fn new(start_bytes: u64) -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: start_bytes,
            bytes_per_sec: 0.0,
        }
    }

    pub fn update(&mut self, total_bytes: u64) -> f64 {
        let elapsed = self.window_start.elapsed();
        let delta = total_bytes.saturating_sub(self.window_bytes) as f64;
        if elapsed >= SPEED_WINDOW {
            self.bytes_per_sec = delta / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_bytes = total_bytes;
        } else if self.bytes_per_sec == 0.0 && !elapsed.is_zero() {
            self.bytes_per_sec = delta / elapsed.as_secs_f64();
        }
        self.bytes_per_sec
    }
}
