//! Byte counters, throughput and ETA estimation for an update run.
//!
//! The estimator is a pure function of the session counters and the time it
//! is given. Updates are coalesced to at most one per second unless forced;
//! the ETA is resampled every five seconds over that window to smooth out
//! bursty I/O.

use std::time::{Duration, Instant};

/// Minimum spacing between unforced status updates
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Window over which the ETA rate is sampled
pub const ETA_WINDOW: Duration = Duration::from_secs(5);

/// ETA text shown until the first sample exists
pub const ETA_CALCULATING: &str = "calculating";

/// Aggregate counters for one update run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSession {
    /// Bytes still to fetch when the download phase began
    pub total_download_bytes: u64,

    /// Bytes fetched by completed or in-flight attempts
    pub downloaded_bytes: u64,

    /// Decompressed size of everything to install
    pub total_install_bytes: u64,

    /// Decompressed bytes installed so far
    pub installed_bytes: u64,
}

impl SyncSession {
    pub fn new(total_download_bytes: u64, total_install_bytes: u64) -> Self {
        Self {
            total_download_bytes,
            downloaded_bytes: 0,
            total_install_bytes,
            installed_bytes: 0,
        }
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
    }

    /// Remove the bytes counted by a failed attempt.
    ///
    /// The failed attempt's bytes stay on disk and the next attempt resumes
    /// after them, so they also leave the download total.
    pub fn rollback_download(&mut self, attempt_bytes: u64) {
        self.downloaded_bytes = self.downloaded_bytes.saturating_sub(attempt_bytes);
        self.total_download_bytes = self.total_download_bytes.saturating_sub(attempt_bytes);
    }

    pub fn record_install(&mut self, bytes: u64) {
        self.installed_bytes += bytes;
    }

    pub fn download_complete(&self) -> bool {
        self.downloaded_bytes >= self.total_download_bytes
    }

    pub fn install_complete(&self) -> bool {
        self.installed_bytes >= self.total_install_bytes
    }
}

/// A rendered status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub percent: u8,
    pub message: String,
}

/// Turns session counters into status lines.
#[derive(Debug)]
pub struct ProgressEstimator {
    next_tick: Option<Instant>,
    last_position: u64,
    next_eta_tick: Instant,
    last_eta_position: u64,
    eta: String,
    current_file: Option<String>,
}

impl ProgressEstimator {
    /// Start estimating; the first ETA sample is taken one window after `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            next_tick: None,
            last_position: 0,
            next_eta_tick: now + ETA_WINDOW,
            last_eta_position: 0,
            eta: ETA_CALCULATING.to_string(),
            current_file: None,
        }
    }

    fn should_emit(&mut self, now: Instant, force: bool) -> bool {
        if !force && self.next_tick.is_some_and(|next| now < next) {
            return false;
        }
        self.next_tick = Some(now + TICK_INTERVAL);
        true
    }

    /// Download-phase status, or `None` if throttled
    pub fn download_status(
        &mut self,
        now: Instant,
        session: &SyncSession,
        force: bool,
    ) -> Option<StatusUpdate> {
        if !self.should_emit(now, force) {
            return None;
        }

        let position = session.downloaded_bytes;
        let total = session.total_download_bytes;

        let bytes_per_second = position.saturating_sub(self.last_position);
        self.last_position = position;

        if now >= self.next_eta_tick || position >= total {
            let window_rate = position.saturating_sub(self.last_eta_position) / ETA_WINDOW.as_secs();
            self.eta = eta_string(total.saturating_sub(position), window_rate);
            self.last_eta_position = position;
            self.next_eta_tick = now + ETA_WINDOW;
        }

        Some(StatusUpdate {
            percent: percent(position, total),
            message: format!(
                "Downloading at {} of {} / {}, ETA {}",
                format_speed(bytes_per_second),
                format_bytes(position),
                format_bytes(total),
                self.eta
            ),
        })
    }

    /// Install-phase status, or `None` if throttled
    pub fn install_status(
        &mut self,
        now: Instant,
        session: &SyncSession,
        current_file: Option<&str>,
        force: bool,
    ) -> Option<StatusUpdate> {
        if let Some(file) = current_file {
            self.current_file = Some(file.to_string());
        }

        if !self.should_emit(now, force) {
            return None;
        }

        let message = if session.install_complete() {
            "Ready!".to_string()
        } else {
            format!("Extracting {}...", self.current_file.as_deref().unwrap_or(""))
        };

        Some(StatusUpdate {
            percent: percent(session.installed_bytes, session.total_install_bytes),
            message,
        })
    }
}

/// `floor(position / total * 100)`, exactly 100 once `position` reaches `total`.
pub fn percent(position: u64, total: u64) -> u8 {
    if position >= total {
        return 100;
    }
    (position as u128 * 100 / total as u128) as u8
}

/// ETA text for `bytes_left` at `bytes_per_second`
pub fn eta_string(bytes_left: u64, bytes_per_second: u64) -> String {
    if bytes_left == 0 {
        return "now".to_string();
    }
    if bytes_per_second == 0 {
        return ETA_CALCULATING.to_string();
    }
    format_eta(bytes_left / bytes_per_second)
}

fn unit(value: u64, singular: &str) -> String {
    if value == 1 {
        format!("{} {}", value, singular)
    } else {
        format!("{} {}s", value, singular)
    }
}

/// Format seconds as e.g. "1 day 2 hours 5 seconds". Zero-valued days,
/// hours and minutes are omitted; seconds are always shown.
pub fn format_eta(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = total_seconds % 86_400 / 3_600;
    let minutes = total_seconds % 3_600 / 60;
    let seconds = total_seconds % 60;

    let mut parts = Vec::with_capacity(4);
    if days > 0 {
        parts.push(unit(days, "day"));
    }
    if hours > 0 {
        parts.push(unit(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(unit(minutes, "minute"));
    }
    parts.push(unit(seconds, "second"));

    parts.join(" ")
}

/// Format bytes with binary prefixes, one decimal below 100 of the unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[(u64, &str)] = &[(1 << 30, "GB"), (1 << 20, "MB"), (1 << 10, "kB")];

    let (value, unit) = UNITS
        .iter()
        .find(|(size, _)| bytes >= *size)
        .map(|(size, unit)| (bytes as f64 / *size as f64, *unit))
        .unwrap_or((bytes as f64, "B"));

    if value < 100.0 {
        let rounded = (value * 10.0).round() / 10.0;
        if rounded.fract() == 0.0 {
            format!("{:.0} {}", rounded, unit)
        } else {
            format!("{:.1} {}", rounded, unit)
        }
    } else {
        format!("{:.0} {}", value, unit)
    }
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
