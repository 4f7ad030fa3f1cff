//! Access log.
//!
//! NCSA-style entries, written through a bounded channel to a dedicated
//! writer thread. The submitting side never blocks the event loop: when the
//! queue is full the entry is dropped.
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where access log entries go.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessLogConfig {
    #[default]
    Disabled,
    Stdout,
    File(PathBuf),
}

/// Handle used by protocol drivers to submit entries.
#[derive(Clone, Debug)]
pub struct AccessLog {
    tx: SyncSender<String>,
}

const QUEUE_CAP: usize = 1024;

impl AccessLog {
    /// Builds the log from configuration, spawning the writer thread.
    /// Returns `None` for a disabled log.
    pub fn from_config(config: &AccessLogConfig) -> std::io::Result<Option<AccessLog>> {
        let mut sink: Box<dyn Write + Send> = match config {
            AccessLogConfig::Disabled => return Ok(None),
            AccessLogConfig::Stdout => Box::new(std::io::stdout()),
            AccessLogConfig::File(path) => {
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
        };

        let (tx, rx) = mpsc::sync_channel::<String>(QUEUE_CAP);
        std::thread::Builder::new()
            .name("daphne-access-log".to_owned())
            .spawn(move || {
                while let Ok(entry) = rx.recv() {
                    if sink.write_all(entry.as_bytes()).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Some(AccessLog { tx }))
    }

    /// Completed HTTP request cycle.
    pub fn http_complete(
        &self,
        client: Option<&(String, u16)>,
        method: &str,
        path: &str,
        status: u16,
        size: u64,
    ) {
        let request = format!("{method} {path}");
        self.write_entry(client, &request, Some(status), Some(size));
    }

    /// WebSocket lifecycle action, one of the `WS*` request verbs.
    pub fn ws_event(&self, action: WsAction, client: Option<&(String, u16)>, path: &str) {
        let request = format!("{} {path}", action.verb());
        self.write_entry(client, &request, None, None);
    }

    fn write_entry(
        &self,
        client: Option<&(String, u16)>,
        request: &str,
        status: Option<u16>,
        size: Option<u64>,
    ) {
        let mut entry = String::with_capacity(64 + request.len());
        match client {
            Some((host, port)) => {
                let _ = write!(entry, "{host}:{port}");
            }
            None => entry.push('-'),
        }
        let _ = write!(entry, " - - [{}] \"{request}\" ", DateStamp::now());
        match status {
            Some(status) => {
                let _ = write!(entry, "{status}");
            }
            None => entry.push('-'),
        }
        entry.push(' ');
        match size {
            Some(size) => {
                let _ = write!(entry, "{size}");
            }
            None => entry.push('-'),
        }
        entry.push('\n');

        // a full queue drops the entry rather than blocking the loop
        if let Err(TrySendError::Full(_)) = self.tx.try_send(entry) {
            log::debug!("access log queue full, entry dropped");
        }
    }
}

/// WebSocket access log actions.
#[derive(Clone, Copy, Debug)]
pub enum WsAction {
    Connecting,
    Connected,
    Rejected,
    Disconnected,
}

impl WsAction {
    fn verb(self) -> &'static str {
        match self {
            WsAction::Connecting => "WSCONNECTING",
            WsAction::Connected => "WSCONNECT",
            WsAction::Rejected => "WSREJECT",
            WsAction::Disconnected => "WSDISCONNECT",
        }
    }
}

// ===== Date stamp =====

/// `02/Aug/2026:10:11:12` timestamp (UTC).
struct DateStamp {
    year: i64,
    month: usize,
    day: u8,
    hour: u8,
    min: u8,
    sec: u8,
}

impl DateStamp {
    fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self::from_unix(secs)
    }

    /// Civil date from days since epoch, mod-400-year cycle arithmetic.
    fn from_unix(secs_since_epoch: u64) -> Self {
        // 2000-03-01, immediately after feb29 of a mod 400 year
        const LEAPOCH: i64 = 11017;
        const DAYS_PER_400Y: i64 = 365 * 400 + 97;
        const DAYS_PER_100Y: i64 = 365 * 100 + 24;
        const DAYS_PER_4Y: i64 = 365 * 4 + 1;

        let days = (secs_since_epoch / 86400) as i64 - LEAPOCH;
        let secs_of_day = secs_since_epoch % 86400;

        let mut qc_cycles = days / DAYS_PER_400Y;
        let mut remdays = days % DAYS_PER_400Y;
        if remdays < 0 {
            remdays += DAYS_PER_400Y;
            qc_cycles -= 1;
        }

        let mut c_cycles = remdays / DAYS_PER_100Y;
        if c_cycles == 4 {
            c_cycles -= 1;
        }
        remdays -= c_cycles * DAYS_PER_100Y;

        let mut q_cycles = remdays / DAYS_PER_4Y;
        if q_cycles == 25 {
            q_cycles -= 1;
        }
        remdays -= q_cycles * DAYS_PER_4Y;

        let mut remyears = remdays / 365;
        if remyears == 4 {
            remyears -= 1;
        }
        remdays -= remyears * 365;

        let mut year = 2000 + remyears + 4 * q_cycles + 100 * c_cycles + 400 * qc_cycles;

        // march-first month lengths
        let months = [31, 30, 31, 30, 31, 31, 30, 31, 30, 31, 31, 29];
        let mut mon = 0;
        for mon_len in months.iter() {
            mon += 1;
            if remdays < *mon_len {
                break;
            }
            remdays -= *mon_len;
        }
        let day = remdays as u8 + 1;
        let month = if mon + 2 > 12 {
            year += 1;
            mon - 10
        } else {
            mon + 2
        };

        DateStamp {
            year,
            month,
            day,
            hour: (secs_of_day / 3600) as u8,
            min: ((secs_of_day % 3600) / 60) as u8,
            sec: (secs_of_day % 60) as u8,
        }
    }
}

impl std::fmt::Display for DateStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MONTHS: [&str; 12] = [
            "Jan", "Feb", "Mar", "Apr", "May", "Jun",
            "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
        ];
        write!(
            f,
            "{:02}/{}/{}:{:02}:{:02}:{:02}",
            self.day,
            MONTHS[self.month - 1],
            self.year,
            self.hour,
            self.min,
            self.sec,
        )
    }
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_date_stamp() {
        // 2016-10-02 14:44:11 UTC
        let stamp = DateStamp::from_unix(1475419451);
        assert_eq!(stamp.to_string(), "02/Oct/2016:14:44:11");
        // epoch
        let stamp = DateStamp::from_unix(0);
        assert_eq!(stamp.to_string(), "01/Jan/1970:00:00:00");
    }
}
