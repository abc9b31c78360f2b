//! Endpoint string handling.
//!
//! Pipe endpoints are bare names mapped to a platform path; TCP endpoints are
//! `"addr:port"` with an empty addr defaulting per role.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{PipelinkError, Result};

/// Map a bare pipe name to its platform rendezvous path.
///
/// - Unix: `/tmp/<name>`
/// - Windows: `\\.\pipe\<name>`
pub(crate) fn pipe_path_for_endpoint(endpoint: &str) -> String {
    #[cfg(unix)]
    {
        format!("/tmp/{}", endpoint)
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\{}", endpoint)
    }
}

/// Which side of the connection is interpreting the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Empty addr means "all interfaces".
    Server,
    /// Empty addr means loopback.
    Client,
}

/// Parse a `"addr:port"` endpoint into a socket address.
///
/// The addr must be an IPv4 literal when present; the port must be a positive
/// integer.
pub(crate) fn parse_tcp_endpoint(endpoint: &str, role: Role) -> Result<SocketAddrV4> {
    let invalid = || {
        PipelinkError::InvalidEndpoint(format!(
            "\"{}\" — should be something like \"127.0.0.1:10000\" or \":10000\"",
            endpoint
        ))
    };

    let (addr, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;

    let port: u16 = match port.parse::<u32>() {
        Ok(p) if p > 0 && p <= u16::MAX as u32 => p as u16,
        _ => return Err(invalid()),
    };

    let ip = if addr.is_empty() {
        match role {
            Role::Server => Ipv4Addr::UNSPECIFIED,
            Role::Client => Ipv4Addr::LOCALHOST,
        }
    } else {
        addr.parse::<Ipv4Addr>().map_err(|_| invalid())?
    };

    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_path_mapping() {
        let path = pipe_path_for_endpoint("my-endpoint");

        #[cfg(unix)]
        assert_eq!(path, "/tmp/my-endpoint");

        #[cfg(windows)]
        assert_eq!(path, r"\\.\pipe\my-endpoint");
    }

    #[test]
    fn test_tcp_full_address() {
        let addr = parse_tcp_endpoint("127.0.0.1:10000", Role::Client).unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10000));
    }

    #[test]
    fn test_tcp_empty_addr_defaults_per_role() {
        let server = parse_tcp_endpoint(":9000", Role::Server).unwrap();
        assert_eq!(*server.ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(server.port(), 9000);

        let client = parse_tcp_endpoint(":9000", Role::Client).unwrap();
        assert_eq!(*client.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(client.port(), 9000);
    }

    #[test]
    fn test_tcp_rejects_bad_forms() {
        for bad in ["", "nocolon", "host:", ":0", ":-5", ":70000", "bad_host:80"] {
            assert!(
                parse_tcp_endpoint(bad, Role::Client).is_err(),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
