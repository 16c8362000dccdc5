//! Local-facing TCP and UDP listeners, and the accept/recv loop that spawns
//! one query task per incoming request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::conn;
use crate::error::Error;
use crate::server::Registry;

const TCP_BACKLOG: i32 = 1024;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind a non-blocking, address-reusing TCP listener, matching
/// `jbro885-montague`'s use of `socket2` for `SO_REUSEADDR`.
fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener, Error> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::ListenFail)?;
    socket.set_reuse_address(true).map_err(Error::ListenFail)?;
    socket.set_nonblocking(true).map_err(Error::ListenFail)?;
    socket.bind(&addr.into()).map_err(Error::ListenFail)?;
    socket.listen(TCP_BACKLOG).map_err(Error::ListenFail)?;
    TcpListener::from_std(socket.into()).map_err(Error::ListenFail)
}

/// Bind a non-blocking, address-reusing UDP socket.
fn bind_udp_socket(addr: SocketAddr) -> Result<UdpSocket, Error> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None).map_err(Error::ListenFail)?;
    socket.set_reuse_address(true).map_err(Error::ListenFail)?;
    socket.set_nonblocking(true).map_err(Error::ListenFail)?;
    socket.bind(&addr.into()).map_err(Error::ListenFail)?;
    UdpSocket::from_std(socket.into()).map_err(Error::ListenFail)
}

/// Apply the accepted-socket options the original sets per TCP client
/// connection: non-blocking (implicit under tokio), keepalive, and a
/// send/receive timeout enforced per-operation via `tokio::time::timeout`
/// at the call sites in [`conn`] rather than `SO_RCVTIMEO`/`SO_SNDTIMEO`,
/// which `tokio` does not expose.
fn configure_accepted_stream(stream: &TcpStream) -> Result<(), Error> {
    stream.set_nodelay(true).map_err(Error::ListenFail)?;
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref
        .set_keepalive(true)
        .map_err(Error::ListenFail)?;
    Ok(())
}

/// Run both listeners until `cancel` fires. Mirrors
/// `clawpot-server::proxy::dns_proxy::run_inner`'s `tokio::select!` shape.
pub async fn run(
    config: Arc<Config>,
    registry: Arc<Registry>,
    bind_addr: SocketAddr,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Error> {
    let tcp_listener = bind_tcp_listener(bind_addr)?;
    let udp_socket = Arc::new(bind_udp_socket(bind_addr)?);
    info!(%bind_addr, "iodns listening (TCP+UDP)");

    let mut udp_buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            accepted = tcp_listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = configure_accepted_stream(&stream) {
                            warn!(%peer, error = %e, "failed to configure accepted socket");
                            continue;
                        }
                        let config = config.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn::handle_tcp(stream, peer, config, registry, SOCKET_TIMEOUT).await {
                                warn!(%peer, error = %e, "TCP query failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            received = udp_socket.recv_from(&mut udp_buf) => {
                match received {
                    Ok((len, peer)) => {
                        let query = udp_buf[..len].to_vec();
                        let config = config.clone();
                        let registry = registry.clone();
                        let reply_socket = udp_socket.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn::handle_udp(query, peer, reply_socket, config, registry, SOCKET_TIMEOUT).await {
                                warn!(%peer, error = %e, "UDP query failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "udp recv failed"),
                }
            }
            _ = cancel.changed() => {
                info!("shutdown signal received, stopping accept/recv loop");
                break;
            }
        }
    }

    Ok(())
}
