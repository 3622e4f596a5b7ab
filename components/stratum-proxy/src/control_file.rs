//! Control-file poller: an operator can switch the proxy to another pool or
//! other credentials by editing a text file, without restarting miners.
//!
//! File format: `host:port [user:pass]`. The file is re-read every N pool
//! notifications; read or parse failures keep the current configuration.

use crate::constants::CONTROL_FILE_INTERVAL;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::{error, info};

/// A successfully parsed control file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileEntry {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

pub fn parse_control_file(data: &str) -> Option<ControlFileEntry> {
    let mut fields = data.split_whitespace();
    let endpoint = fields.next()?;
    let (host, port) = endpoint.split_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;

    let credentials = match fields.next() {
        Some(auth) => {
            let (user, pass) = auth.split_once(':')?;
            Some((user.to_string(), pass.to_string()))
        }
        None => None,
    };

    Some(ControlFileEntry { host: host.to_string(), port, credentials })
}

pub struct ControlFile {
    path: PathBuf,
    interval: u32,
    counter: Mutex<u32>,
}

impl ControlFile {
    pub fn new(path: PathBuf, interval: Option<u32>) -> Self {
        Self { path, interval: interval.unwrap_or(CONTROL_FILE_INTERVAL), counter: Mutex::new(0) }
    }

    /// Called once per pool notification. Every `interval` calls the file is
    /// re-read; returns the parsed entry when it is due and readable.
    pub fn poll(&self) -> Option<ControlFileEntry> {
        {
            let mut counter = self.counter.lock();
            *counter += 1;
            if *counter <= self.interval {
                return None;
            }
            *counter = 0;
        }

        info!("checking control file {}", self.path.display());
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) => {
                error!(
                    "cannot read control file {}, keeping current pool configuration: {err}",
                    self.path.display()
                );
                return None;
            }
        };

        match parse_control_file(&data) {
            Some(entry) => Some(entry),
            None => {
                error!(
                    "cannot parse control file {}, keeping current pool configuration",
                    self.path.display()
                );
                None
            }
        }
    }
}
