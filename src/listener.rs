//! Dual-stack listening sockets.
//!
//! One listener per enabled protocol, both on the same port. The v6 socket
//! sets `IPV6_V6ONLY` so the v4 socket can bind the same port; one socket
//! per protocol also keeps the full v6 address space usable instead of the
//! v4-mapped subset. Startup succeeds with at least one live listener and
//! fails with none.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::error;

use crate::config::ServerConfig;

/// Connection backlog for each listening socket.
const LISTEN_BACKLOG: i32 = 16;

/// The enabled listeners, ready to accept.
pub struct ListenerSet {
    pub v4: Option<TcpListener>,
    pub v6: Option<TcpListener>,
}

impl ListenerSet {
    /// Bind the listeners named by the config.
    ///
    /// A listener that fails to bind is logged and skipped; only a fully
    /// empty set is an error. Must be called from within a tokio runtime.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let v6 = if config.disable_ipv6 {
            None
        } else {
            match parse_addr(&config.bind_addr_6, config.port)
                .and_then(|addr| bind_listener(addr))
            {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!("Error creating server socket ({}): {e}", config.bind_addr_6);
                    None
                }
            }
        };

        let v4 = if config.disable_ipv4 {
            None
        } else {
            match parse_addr(&config.bind_addr_4, config.port)
                .and_then(|addr| bind_listener(addr))
            {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!("Error creating server socket ({}): {e}", config.bind_addr_4);
                    None
                }
            }
        };

        if v4.is_none() && v6.is_none() {
            error!("Failed to create any listening socket. Nothing to do except shut down.");
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no listening socket could be created",
            ));
        }

        Ok(Self { v4, v6 })
    }

    /// Local addresses of the live listeners (v4 first). Mostly useful when
    /// binding port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.v4
            .iter()
            .chain(self.v6.iter())
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }
}

fn parse_addr(addr: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{addr}: {e}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Full setup for one server socket: non-blocking, close-on-exec,
/// `SO_REUSEADDR`, v6-only where applicable, backlog 16.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    // socket2 opens stream sockets with SOCK_CLOEXEC on Linux.
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Fast address re-use across restarts.
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
