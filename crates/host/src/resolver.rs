//! Nameserver handed to accessories in their serial string

use protocol::DEFAULT_NAMESERVER;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Setting value that selects the system resolver
pub const LOCAL: &str = "local";

/// Nameserver setting errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Invalid nameserver '{0}': expected IPv4 address or 'local'")]
    InvalidNameserver(String),
}

/// First IPv4 `nameserver` entry of a resolv.conf
pub fn parse_nameserver(contents: &str) -> Option<Ipv4Addr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse().ok(),
                _ => None,
            }
        })
        .next()
}

/// First nameserver of the given resolv.conf, or the default
pub fn system_nameserver(path: &Path) -> Ipv4Addr {
    let found = std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| parse_nameserver(&contents));

    match found {
        Some(addr) => addr,
        None => {
            warn!(
                "Cannot find system nameserver in {}, using {}",
                path.display(),
                DEFAULT_NAMESERVER
            );
            DEFAULT_NAMESERVER
        }
    }
}

/// Resolve the configured nameserver once at startup
///
/// `"local"` reads [`RESOLV_CONF`]; anything else must be an IPv4 address.
pub fn resolve_nameserver(setting: &str) -> Result<Ipv4Addr, ResolverError> {
    let addr = if setting.eq_ignore_ascii_case(LOCAL) {
        system_nameserver(Path::new(RESOLV_CONF))
    } else {
        setting
            .parse()
            .map_err(|_| ResolverError::InvalidNameserver(setting.to_string()))?
    };

    info!("Using nameserver {}", addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_first_ipv4_entry() {
        let contents = "\
# generated by NetworkManager
search lan
nameserver fe80::1
nameserver 192.168.1.1
nameserver 1.1.1.1
";
        assert_eq!(
            parse_nameserver(contents),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
    }

    #[test]
    fn test_parse_skips_comments() {
        let contents = "; nameserver 9.9.9.9\n#nameserver 9.9.9.9\n  nameserver   10.0.0.53  \n";
        assert_eq!(parse_nameserver(contents), Some(Ipv4Addr::new(10, 0, 0, 53)));
    }

    #[test]
    fn test_parse_nothing() {
        assert_eq!(parse_nameserver(""), None);
        assert_eq!(parse_nameserver("nameserver\nsearch example.com\n"), None);
    }

    #[test]
    fn test_system_nameserver_fallback() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "options edns0").unwrap();
        assert_eq!(system_nameserver(file.path()), DEFAULT_NAMESERVER);

        assert_eq!(
            system_nameserver(Path::new("/nonexistent/resolv.conf")),
            DEFAULT_NAMESERVER
        );
    }

    #[test]
    fn test_system_nameserver_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 127.0.0.53").unwrap();
        assert_eq!(system_nameserver(file.path()), Ipv4Addr::new(127, 0, 0, 53));
    }

    #[test]
    fn test_resolve_explicit() {
        assert_eq!(resolve_nameserver("9.9.9.9"), Ok(Ipv4Addr::new(9, 9, 9, 9)));
        assert_eq!(
            resolve_nameserver("dns.example"),
            Err(ResolverError::InvalidNameserver("dns.example".to_string()))
        );
        assert!(resolve_nameserver("::1").is_err());
    }
}
