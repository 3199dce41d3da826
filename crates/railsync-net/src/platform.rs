//! TCP socket options applied to dispatcher and client sockets.
//!
//! Keepalive probes are how a silently vanished peer is detected: the read
//! fails with a timeout and the connection goes through its normal shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Idle time before the first keepalive probe; `None` disables keepalive.
    pub keepalive_idle: Option<Duration>,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Enable `SO_REUSEADDR` on listening sockets. Default: off on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_idle: Some(Duration::from_secs(60)),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply `config` to a connected stream (both accepted and dialled).
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(idle) = config.keepalive_idle {
        let keepalive = TcpKeepalive::new()
            .with_time(idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind the dispatcher socket. `SO_REUSEADDR` must be set before `bind`, so
/// the socket is built through socket2 and handed to tokio afterwards.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

/// Failure to turn a host name and port into a socket address.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Name resolution failed.
    #[error("could not resolve {address}: {source}")]
    Resolve {
        /// The address as given.
        address: String,
        /// The resolver error.
        #[source]
        source: std::io::Error,
    },

    /// Resolution succeeded but produced no address.
    #[error("{0} resolved to no address")]
    NoAddress(String),
}

/// Resolve `address:port`, preferring IPv4 results.
pub async fn resolve_address(address: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((address, port))
        .await
        .map_err(|source| ConnectError::Resolve {
            address: address.to_string(),
            source,
        })?
        .collect();
    resolved
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| ConnectError::NoAddress(address.to_string()))
}

/// IPv4 wildcard address for the dispatcher port.
pub fn bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client socket connected to a fresh loopback listener, with `config`
    /// applied.
    async fn configured_client(config: &SocketConfig) -> (TcpListener, TcpStream) {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        configure_stream(&client, config).unwrap();
        (listener, client)
    }

    #[tokio::test]
    async fn test_defaults_enable_nodelay_and_keepalive() {
        let (_listener, client) = configured_client(&SocketConfig::default()).await;
        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_zero_keepalive_setting_disables_probes() {
        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive_idle: None,
            ..SocketConfig::default()
        };
        let (_listener, client) = configured_client(&config).await;
        assert!(!client.nodelay().unwrap());
        assert!(!SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_prefers_literal_ipv4() {
        let addr = resolve_address("127.0.0.1", 4100).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 4100)));
    }

    #[tokio::test]
    async fn test_resolve_failure_names_the_host() {
        let err = resolve_address("no-such-host.invalid", 30000).await.unwrap_err();
        assert!(err.to_string().contains("no-such-host.invalid"));
    }

    #[test]
    fn test_dispatcher_binds_every_interface() {
        let addr = bind_address(30000);
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 30000);
    }
}
