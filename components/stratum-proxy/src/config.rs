//! Command line surface.

use crate::poolapi::PoolEndpoint;
use clap::Parser;
use std::path::PathBuf;

/// This proxy allows you to run getwork-based miners against Stratum mining
/// pools.
#[derive(Parser, Debug)]
#[command(name = "stratum-proxy", version)]
pub struct Args {
    /// Hostname of Stratum mining pool
    #[arg(short = 'o', long, default_value = "stratum.bitcoin.cz")]
    pub host: String,

    /// Port of Stratum mining pool
    #[arg(short = 'p', long, default_value_t = 3333)]
    pub port: u16,

    /// On which network interface listen for stratum miners. Use "localhost"
    /// for listening on internal IP only.
    #[arg(long = "stratum-host", default_value = "0.0.0.0")]
    pub stratum_host: String,

    /// Port on which to listen for stratum miners; 0 disables the listener
    #[arg(long = "stratum-port", default_value_t = 3333)]
    pub stratum_port: u16,

    /// On which network interface listen for getwork miners
    #[arg(long = "getwork-host", default_value = "0.0.0.0")]
    pub getwork_host: String,

    /// Port on which to listen for getwork miners; 0 disables the listener.
    /// Use another port if you have bitcoind RPC running on this machine
    /// already.
    #[arg(long = "getwork-port", default_value_t = 8332)]
    pub getwork_port: u16,

    /// Don't compute midstate for getwork. This is a performance boost, but
    /// some old miners don't work without midstate.
    #[arg(long = "no-midstate")]
    pub no_midstate: bool,

    /// Propagate the real (>diff1) target to getwork miners. Some miners
    /// work incorrectly with higher difficulty.
    #[arg(long = "real-target")]
    pub real_target: bool,

    /// Provide backward compatible targets for deprecated getwork miners
    #[arg(long = "old-target")]
    pub old_target: bool,

    /// Calculate targets for the scrypt algorithm
    #[arg(long = "scrypt-target")]
    pub scrypt_target: bool,

    /// Backup pool, as host:port; used when the primary drops uncleanly
    #[arg(long, value_name = "HOST:PORT")]
    pub backup: Option<String>,

    /// Override the URL provided in the X-Long-Polling header
    #[arg(long = "custom-lp")]
    pub custom_lp: Option<String>,

    /// Override the URL provided in the X-Stratum header
    #[arg(long = "custom-stratum")]
    pub custom_stratum: Option<String>,

    /// Use this username for submitting shares
    #[arg(long = "custom-user")]
    pub custom_user: Option<String>,

    /// Use this password for submitting shares
    #[arg(long = "custom-password", default_value = "")]
    pub custom_password: String,

    /// Switch pool or credentials when this file changes; format:
    /// "host:port [user:pass]"
    #[arg(long = "control-file")]
    pub control_file: Option<PathBuf>,

    /// Control file check cadence, counted in pool notifications
    #[arg(long = "cf-interval")]
    pub cf_interval: Option<u32>,

    /// Send mining.extranonce.subscribe to the pool after subscribing
    #[arg(long = "set-extranonce")]
    pub set_extranonce: bool,

    /// Retry upstream forever instead of exiting after repeated dead
    /// connections
    #[arg(long)]
    pub idle: bool,

    /// Execute command when the best block changes (%s is replaced by the
    /// block prevhash)
    #[arg(long = "blocknotify", value_name = "CMD")]
    pub blocknotify: Option<String>,

    /// Execute this command per accepted share (worker, job id and
    /// difficulty are appended as arguments)
    #[arg(long = "sharenotify", value_name = "PATH")]
    pub sharenotify: Option<String>,

    /// Use a socks5 proxy for the upstream Stratum connection
    #[arg(long, value_name = "HOST:PORT")]
    pub socks: Option<String>,

    /// Serve prometheus metrics on this port
    #[arg(long = "prom-port")]
    pub prom_port: Option<u16>,

    /// Enable low-level debugging messages
    #[arg(short, long)]
    pub verbose: bool,

    /// Make output more quiet
    #[arg(short, long)]
    pub quiet: bool,

    /// Store process pid to the file
    #[arg(short = 'i', long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    /// Log to the specified file
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,
}

/// Parse a "host:port" argument.
pub fn parse_endpoint(value: &str) -> anyhow::Result<PoolEndpoint> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got '{value}'"))?;
    if host.is_empty() {
        anyhow::bail!("empty host in '{value}'");
    }
    let port = port.parse().map_err(|_| anyhow::anyhow!("bad port in '{value}'"))?;
    Ok(PoolEndpoint { host: host.to_string(), port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let endpoint = parse_endpoint("mypool.com:3333").unwrap();
        assert_eq!(endpoint.host, "mypool.com");
        assert_eq!(endpoint.port, 3333);

        assert!(parse_endpoint("mypool.com").is_err());
        assert!(parse_endpoint(":3333").is_err());
        assert!(parse_endpoint("mypool.com:zzz").is_err());
    }

    #[test]
    fn defaults_match_the_classic_proxy() {
        let args = Args::parse_from(["stratum-proxy"]);
        assert_eq!(args.port, 3333);
        assert_eq!(args.stratum_port, 3333);
        assert_eq!(args.getwork_port, 8332);
        assert!(!args.no_midstate);
        assert!(args.custom_user.is_none());
    }
}
