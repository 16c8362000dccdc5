//! Per-query state machine.
//!
//! Each TCP accept and each UDP datagram becomes one `tokio::spawn`ed task
//! that owns its own sockets and cipher state end-to-end: connect to a
//! remote ioserver (retrying across servers on failure), send the encrypted
//! request, read back one encrypted reply, decrypt, and answer the client.
//! This replaces the original's `ev_io` callback chain (accept_cb ->
//! local_read_cb -> connect_cb -> remote_write_cb -> remote_read_cb ->
//! local_write_cb -> closewait_cb) with sequential `.await`s; the task's
//! scope-exit is the closewait timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::info;

use crate::config::Config;
use crate::dns;
use crate::error::Error;
use crate::request::{build_request, Request};
use crate::server::Registry;

/// Number of distinct remote servers to try before giving up on a query,
/// matching the original's `MAX_TRY`.
const MAX_TRY: u32 = 4;

/// Linger before the TCP client socket is dropped, matching the original's
/// `closewait_cb` 1.0s timer.
const CLOSEWAIT: Duration = Duration::from_millis(1000);

const REMOTE_RECV_BUF: usize = 8192;

/// Connect to a remote ioserver, retrying up to [`MAX_TRY`] times against
/// freshly-selected (possibly repeated) servers. Each failed attempt marks
/// that server unhealthy, mirroring `connect_server()`'s `health = -10`.
async fn connect_with_retry(
    registry: &Registry,
    timeout: Duration,
) -> Result<(TcpStream, usize), Error> {
    let mut last_err = None;
    for _ in 0..MAX_TRY {
        let id = registry.select_server(&mut rand::thread_rng());
        let entry = registry.get(id);
        match tokio::time::timeout(timeout, TcpStream::connect(entry.addr)).await {
            Ok(Ok(stream)) => return Ok((stream, id)),
            Ok(Err(e)) => {
                entry.mark_unhealthy();
                last_err = Some(e);
            }
            Err(_) => {
                entry.mark_unhealthy();
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ));
            }
        }
    }
    Err(Error::RemoteConnectFail(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "no servers configured")
    })))
}

/// Write `buf` to `remote` via repeated partial writes rather than
/// `write_all`, so a chunked remote socket produces exactly as many
/// `write()` calls as the underlying transport allows — a direct analogue
/// of the original's `remote_write_cb` being re-armed on every partial
/// write. Generic over `AsyncWrite` so the offset accounting can be
/// exercised against a mock writer in tests.
async fn send_to_remote<W: AsyncWrite + Unpin>(remote: &mut W, buf: &[u8]) -> Result<(), Error> {
    let mut offset = 0;
    while offset < buf.len() {
        let n = remote
            .write(&buf[offset..])
            .await
            .map_err(Error::RemoteReset)?;
        if n == 0 {
            return Err(Error::RemoteReset(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "remote closed mid-write",
            )));
        }
        offset += n;
    }
    Ok(())
}

/// Read exactly one reply from the remote, a single `read()` with no
/// length-based reassembly. The original does the same; spec.md's Open
/// Question on this is resolved in favor of preserving it for wire
/// compatibility rather than adding framing the protocol never promised.
async fn recv_from_remote(remote: &mut TcpStream) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; REMOTE_RECV_BUF];
    let n = remote.read(&mut buf).await.map_err(Error::RemoteReset)?;
    if n == 0 {
        return Err(Error::RemoteReset(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "remote closed before replying",
        )));
    }
    buf.truncate(n);
    Ok(buf)
}

/// Perform the shared connect -> send -> receive -> decrypt cycle against
/// `payload` (already framed for the transport), returning the decrypted
/// reply bytes.
async fn round_trip(
    registry: &Registry,
    config: &Config,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, Error> {
    let (mut remote, id) = connect_with_retry(registry, timeout).await?;
    let secret = registry.get(id).secret.clone();

    let Request { record, mut cipher } = build_request(
        &config.dns.upstream_address,
        &config.dns.upstream_port,
        &secret,
        payload,
    );

    tokio::time::timeout(timeout, send_to_remote(&mut remote, &record))
        .await
        .map_err(|_| Error::RemoteReset(std::io::Error::new(std::io::ErrorKind::TimedOut, "remote write timed out")))??;

    let mut reply = tokio::time::timeout(timeout, recv_from_remote(&mut remote))
        .await
        .map_err(|_| Error::RemoteReset(std::io::Error::new(std::io::ErrorKind::TimedOut, "remote read timed out")))??;

    cipher.decrypt.apply_keystream(&mut reply);
    Ok(reply)
}

/// Read a client's length-prefixed TCP query, returning the framed bytes
/// (2-byte length prefix + message) verbatim. Generic over `AsyncRead` so
/// the early-disconnect path can be exercised against `tokio::io::duplex`
/// in tests.
async fn read_client_query<R: AsyncRead + Unpin>(client: &mut R) -> Result<Vec<u8>, Error> {
    let mut len_buf = [0u8; 2];
    client
        .read_exact(&mut len_buf)
        .await
        .map_err(Error::ClientReset)?;
    let msg_len = u16::from_be_bytes(len_buf) as usize;

    let mut message = vec![0u8; msg_len];
    client
        .read_exact(&mut message)
        .await
        .map_err(Error::ClientReset)?;

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len_buf);
    framed.extend_from_slice(&message);
    Ok(framed)
}

/// Handle one TCP client connection end to end: one query, one reply.
pub async fn handle_tcp(
    mut client: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    registry: Arc<Registry>,
    timeout: Duration,
) -> Result<(), Error> {
    let framed = read_client_query(&mut client).await?;

    // A malformed query is fatal for this connection: no remote connect is
    // attempted, matching `connect_server()`'s handling of an `ns_initparse`
    // failure in the original (iodns.c:621-627).
    let qname = dns::extract_qname(&framed[2..])?;
    info!(%peer, %qname, proto = "tcp", "query");

    let reply = round_trip(&registry, &config, &framed, timeout).await?;

    client.write_all(&reply).await.map_err(Error::SendFail)?;

    tokio::time::sleep(CLOSEWAIT).await;
    Ok(())
}

/// Handle one UDP datagram end to end: one query, one reply.
pub async fn handle_udp(
    message: Vec<u8>,
    peer: SocketAddr,
    reply_socket: Arc<UdpSocket>,
    config: Arc<Config>,
    registry: Arc<Registry>,
    timeout: Duration,
) -> Result<(), Error> {
    // Same rule as the TCP path: a parse failure terminates the query
    // before any remote connect is attempted.
    let qname = dns::extract_qname(&message)?;
    info!(%peer, %qname, proto = "udp", "query");

    let framed = dns::frame_udp_payload(&message);
    let reply = round_trip(&registry, &config, &framed, timeout).await?;
    let unframed = dns::strip_udp_prefix(&reply)?;

    reply_socket
        .send_to(unframed, peer)
        .await
        .map_err(Error::SendFail)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DnsConfig};
    use crate::server::ServerEntry;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    fn local_config(upstream: &str, port: &str) -> Config {
        Config {
            dns: DnsConfig {
                address: "127.0.0.1".into(),
                port: "0".into(),
                upstream_address: upstream.into(),
                upstream_port: port.into(),
            },
            server: vec![],
            user: None,
            group: None,
        }
    }

    /// A fake ioserver that behaves like the real one closely enough for
    /// this test: it reads the salt straight off the wire (it is sent in
    /// clear, per the handshake layout), derives the same key our client
    /// did, and replies with `reply_plain` encrypted under a fresh stream —
    /// exactly mirroring the independence of `CipherPair`'s two halves.
    async fn spawn_fake_ioserver(secret: Vec<u8>, reply_plain: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                if let Ok(n) = stream.read(&mut buf).await {
                    if n >= 512 {
                        let salt = &buf[276..512];
                        let key = crate::request::derive_key(salt, &secret);
                        let mut cipher = crate::cipher::Rc4::new(&key);
                        let mut out = reply_plain.clone();
                        cipher.apply_keystream(&mut out);
                        let _ = stream.write_all(&out).await;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn round_trip_decrypts_remote_reply() {
        let secret = b"shared".to_vec();
        let payload = b"hello".to_vec();
        let reply_plain = b"reply-bytes".to_vec();

        let fake_addr = spawn_fake_ioserver(secret.clone(), reply_plain.clone()).await;

        let registry = Registry::new(vec![ServerEntry::new(fake_addr, &secret)]);
        let config = local_config("8.8.8.8", "53");

        let reply = round_trip(&registry, &config, &payload, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, reply_plain);
    }

    #[tokio::test]
    async fn connect_with_retry_exhausts_after_max_try() {
        // No listener bound at this address: every connect attempt fails.
        let dead_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let registry = Registry::new(vec![ServerEntry::new(dead_addr, b"s")]);
        let err = connect_with_retry(&registry, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteConnectFail(_)));
        assert_eq!(registry.get(0).health(), -10);
    }

    #[tokio::test]
    async fn connect_with_retry_fails_over_to_healthy_server() {
        let dead_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let good_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let registry = Registry::new(vec![
            ServerEntry::new(dead_addr, b"a"),
            ServerEntry::new(good_addr, b"b"),
        ]);
        let (_, id) = connect_with_retry(&registry, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(registry.get(id).addr, good_addr);
    }

    /// A mock `AsyncWrite` that accepts at most `chunk_size` bytes per
    /// `write()` call, so `send_to_remote`'s partial-write loop is forced
    /// through multiple iterations instead of completing in one call.
    struct ChunkedWriter {
        chunk_size: usize,
        received: Vec<u8>,
        write_calls: usize,
    }

    impl ChunkedWriter {
        fn new(chunk_size: usize) -> Self {
            ChunkedWriter {
                chunk_size,
                received: Vec::new(),
                write_calls: 0,
            }
        }
    }

    impl tokio::io::AsyncWrite for ChunkedWriter {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.chunk_size);
            self.received.extend_from_slice(&buf[..n]);
            self.write_calls += 1;
            std::task::Poll::Ready(Ok(n))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn send_to_remote_advances_offset_across_chunked_writes() {
        // 600 bytes in 100-byte chunks: exactly 6 writable events, matching
        // the chunked-remote scenario.
        let mut writer = ChunkedWriter::new(100);
        let data = vec![7u8; 600];

        send_to_remote(&mut writer, &data).await.unwrap();

        assert_eq!(writer.received, data);
        assert_eq!(writer.write_calls, 6);
    }

    #[tokio::test]
    async fn client_query_read_fails_with_client_reset_on_early_disconnect() {
        let (mut client_side, mut handler_side) = tokio::io::duplex(64);
        let handle = tokio::spawn(async move { read_client_query(&mut handler_side).await });

        // Declare a 10-byte message, send only 3 bytes, then disconnect.
        client_side.write_all(&10u16.to_be_bytes()).await.unwrap();
        client_side.write_all(&[1, 2, 3]).await.unwrap();
        drop(client_side);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ClientReset(_)));
    }
}
