//! Classical DNS exchanges
//!
//! One-shot query/response over UDP, plus the 2-byte length framing used
//! by DNS over TCP streams.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::reqid;

/// Per-exchange timeout
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum DNS message size over a stream
const MAX_STREAM_RESPONSE_SIZE: usize = 65535;

/// Send a single query to a classical DNS server over UDP and wait for the
/// reply. The reply must carry the query's ID.
pub async fn exchange_udp(req: &Message, server: SocketAddr) -> Result<Message> {
    let packed = req
        .to_vec()
        .map_err(|e| Error::Decode(format!("cannot pack query: {e}")))?;

    let bind_addr = if server.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket
        .connect(server)
        .await
        .map_err(|e| Error::Transport(format!("connect to {server} failed: {e}")))?;
    socket
        .send(&packed)
        .await
        .map_err(|e| Error::Transport(format!("send to {server} failed: {e}")))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    match tokio::time::timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => {
            buf.truncate(len);
            let reply = Message::from_vec(&buf)
                .map_err(|e| Error::Decode(format!("cannot unpack reply: {e}")))?;
            if reply.id() != req.id() {
                return Err(Error::Validation("reply ID does not match query".into()));
            }
            Ok(reply)
        }
        Ok(Err(e)) => Err(Error::Transport(format!("recv from {server} failed: {e}"))),
        Err(_) => Err(Error::UpstreamTimeout),
    }
}

/// Read one length-prefixed DNS message from a stream.
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Transport(format!("frame length read failed: {e}"))),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_STREAM_RESPONSE_SIZE {
        return Err(Error::Decode("frame too large".into()));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("frame read failed: {e}")))?;
    Ok(Some(payload))
}

/// Write one length-prefixed DNS message to a stream.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_STREAM_RESPONSE_SIZE {
        return Err(Error::Decode("message exceeds frame size limit".into()));
    }

    stream
        .write_u16(payload.len() as u16)
        .await
        .map_err(|e| Error::Transport(format!("frame length write failed: {e}")))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::Transport(format!("frame write failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("frame flush failed: {e}")))?;
    Ok(())
}

/// Resolve a hostname by querying a fixed DNS server directly, bypassing
/// the operating system's resolver.
///
/// Used to bootstrap the DoH upstream's hostname when this process is
/// itself the system resolver. Ports in the result are zero; callers fill
/// in their own.
pub async fn lookup_host(host: &str, server: SocketAddr) -> Result<Vec<SocketAddr>> {
    let mut name = Name::from_utf8(host).map_err(|e| Error::Decode(format!("bad name: {e}")))?;
    name.set_fqdn(true);

    let mut addrs = Vec::new();
    for rtype in [RecordType::A, RecordType::AAAA] {
        let mut req = Message::new();
        req.set_id(reqid::next_id().await);
        req.set_recursion_desired(true);
        req.add_query(Query::query(name.clone(), rtype));

        let reply = match exchange_udp(&req, server).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(host, %server, %rtype, error = %e, "bootstrap lookup failed");
                continue;
            }
        };

        for record in reply.answers() {
            match record.data() {
                Some(RData::A(a)) => addrs.push(SocketAddr::new(IpAddr::V4(a.0), 0)),
                Some(RData::AAAA(aaaa)) => addrs.push(SocketAddr::new(IpAddr::V6(aaaa.0), 0)),
                _ => {}
            }
        }
    }

    if addrs.is_empty() {
        return Err(Error::Transport(format!("no addresses found for {host}")));
    }
    Ok(addrs)
}
