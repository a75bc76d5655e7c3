use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::core::watcher::{WatchScope, DEFAULT_DOCKER_SOCKET};

pub const DEFAULT_SOCKET: &str = "/run/docker/plugins/weave.sock";

#[derive(Parser, Debug, Clone)]
#[command(name = "netplugin", version)]
#[command(about = "netplugin is a remote network driver for the Docker engine.")]
pub struct Config {
    /// Socket the engine talks to.
    #[arg(long, env = "NETPLUGIN_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// Enable debug logging.
    #[arg(long, env = "NETPLUGIN_DEBUG")]
    pub debug: bool,

    /// Nameserver to advertise to containers.
    #[arg(long, env = "NETPLUGIN_NAMESERVER")]
    pub nameserver: Option<Ipv4Addr>,

    /// Forwarding device endpoints are attached to.
    #[arg(long, env = "NETPLUGIN_DEVICE", default_value = "weave")]
    pub device: String,

    /// Domain whose containers are registered with the name service.
    #[arg(long, env = "NETPLUGIN_DOMAIN", default_value = "weave.local")]
    pub domain: String,

    /// Base URL of the address allocation service.
    #[arg(long, env = "NETPLUGIN_IPAM_URL", default_value = "http://127.0.0.1:6784")]
    pub ipam_url: String,

    /// Base URL of the name service.
    #[arg(long, env = "NETPLUGIN_DNS_URL", default_value = "http://127.0.0.1:6785")]
    pub dns_url: String,

    #[arg(long, env = "NETPLUGIN_DOCKER_SOCKET", default_value = DEFAULT_DOCKER_SOCKET)]
    pub docker_socket: PathBuf,

    /// Directory for the generated resolv.conf.
    #[arg(long, env = "NETPLUGIN_CONF_DIR", default_value = "/run/netplugin")]
    pub conf_dir: PathBuf,

    /// Which containers the event watcher registers.
    #[arg(long, env = "NETPLUGIN_WATCH_SCOPE", value_enum, default_value_t = WatchScope::Domain)]
    pub watch_scope: WatchScope,

    /// Bound on every call to the allocation and name services, e.g. 10s, 500ms.
    #[arg(long, env = "NETPLUGIN_PEER_TIMEOUT", default_value = "10s", value_parser(parse_duration))]
    pub peer_timeout: Duration,

    /// Do not watch container events.
    #[arg(long, env = "NETPLUGIN_NO_WATCH")]
    pub no_watch: bool,
}

impl Config {
    pub fn resolv_conf_path(&self) -> PathBuf {
        self.conf_dir.join("resolv.conf")
    }

    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

/// Parse a duration such as `10`, `10s` or `500ms`. A bare number is seconds.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim().to_lowercase();

    let (number, millis): (&str, u64) = if let Some(n) = input.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = input.strip_suffix('s') {
        (n, 1000)
    } else if let Some(n) = input.strip_suffix('m') {
        (n, 60 * 1000)
    } else {
        (input.as_str(), 1000)
    };

    let number: u64 = number.parse().map_err(|e| format!("{e}"))?;
    if number == 0 {
        return Err("Timeout must be positive".into());
    }

    let millis = number.checked_mul(millis).ok_or("Timeout too large")?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["netplugin"]).unwrap();

        assert_eq!(config.socket, PathBuf::from(DEFAULT_SOCKET));
        assert_eq!(config.device, "weave");
        assert_eq!(config.domain, "weave.local");
        assert_eq!(config.nameserver, None);
        assert_eq!(config.watch_scope, WatchScope::Domain);
        assert_eq!(config.peer_timeout, Duration::from_secs(10));
        assert_eq!(config.log_level(), "info");
        assert!(!config.no_watch);
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "netplugin",
            "--socket",
            "/tmp/np.sock",
            "--nameserver",
            "172.17.0.1",
            "--device",
            "datapath",
            "--conf-dir",
            "/tmp/np",
            "--watch-scope",
            "network",
            "--peer-timeout",
            "500ms",
            "--debug",
            "--no-watch",
        ])
        .unwrap();

        assert_eq!(config.socket, PathBuf::from("/tmp/np.sock"));
        assert_eq!(config.nameserver, Some(Ipv4Addr::new(172, 17, 0, 1)));
        assert_eq!(config.device, "datapath");
        assert_eq!(config.resolv_conf_path(), PathBuf::from("/tmp/np/resolv.conf"));
        assert_eq!(config.watch_scope, WatchScope::Network);
        assert_eq!(config.peer_timeout, Duration::from_millis(500));
        assert_eq!(config.log_level(), "debug");
        assert!(config.no_watch);
    }

    #[test]
    fn test_invalid_nameserver() {
        assert!(Config::try_parse_from(["netplugin", "--nameserver", "weave"]).is_err());
        assert!(Config::try_parse_from(["netplugin", "--nameserver", "fe80::1"]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration(" 3S ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(
            parse_duration("18446744073709551615m").unwrap_err(),
            "Timeout too large"
        );
        assert!(parse_duration("18446744073709551615s").is_err());
        assert_eq!(
            parse_duration("18446744073709551615ms").unwrap(),
            Duration::from_millis(u64::MAX)
        );
        assert!(Config::try_parse_from(["netplugin", "--peer-timeout", "18446744073709551615m"]).is_err());
    }
}
