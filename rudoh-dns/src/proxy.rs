//! DNS front-end server
//!
//! Listens for classical DNS queries over UDP and TCP on one address and
//! answers them through the configured resolver, with two routing
//! shortcuts that bypass it: per-domain overrides and unqualified names.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::activation;
use crate::domainmap::{label_count, DomainMap};
use crate::error::{Error, Result};
use crate::exchange;
use crate::reqid;
use crate::resolver::Resolver;

/// Listen address sentinel for consuming pre-bound sockets
pub const SYSTEMD_ADDR: &str = "systemd";

/// Reply size every DNS client must accept over UDP
const DNS_MIN_UDP_SIZE: usize = 512;

/// Largest request we accept over UDP
const MAX_UDP_QUERY_SIZE: usize = 4096;

struct ProxyState {
    resolver: Arc<dyn Resolver>,
    unqualified_upstream: Option<SocketAddr>,
    overrides: DomainMap,
}

/// DNS proxy server fronting a resolver.
pub struct DnsProxy {
    addr: String,
    state: Arc<ProxyState>,
}

impl DnsProxy {
    /// Create a new proxy listening on `addr` (or the `"systemd"`
    /// sentinel), resolving through `resolver`.
    ///
    /// `unqualified_upstream` is consulted for single-label names, and
    /// `overrides` routes matching domains to specific classical servers.
    pub fn new(
        addr: String,
        resolver: Arc<dyn Resolver>,
        unqualified_upstream: Option<SocketAddr>,
        overrides: DomainMap,
    ) -> Self {
        Self {
            addr,
            state: Arc::new(ProxyState {
                resolver,
                unqualified_upstream,
                overrides,
            }),
        }
    }

    /// Initialize the resolver, start its maintenance, and serve until a
    /// listener fails.
    pub async fn run(self) -> Result<()> {
        self.state.resolver.init().await?;

        let resolver = self.state.resolver.clone();
        tokio::spawn(async move { resolver.maintain().await });

        if self.addr == SYSTEMD_ADDR {
            self.systemd_serve().await
        } else {
            self.classic_serve().await
        }
    }

    async fn classic_serve(&self) -> Result<()> {
        let udp = UdpSocket::bind(&self.addr).await?;
        let tcp = TcpListener::bind(&self.addr).await?;

        info!(addr = %self.addr, "DNS listening");

        tokio::try_join!(
            serve_udp(self.state.clone(), udp),
            serve_tcp(self.state.clone(), tcp),
        )?;
        Ok(())
    }

    async fn systemd_serve(&self) -> Result<()> {
        let inherited = activation::inherited_sockets()?;
        if inherited.udp.is_empty() && inherited.tcp.is_empty() {
            return Err(Error::Config(
                "no systemd sockets, did you forget the .socket?".into(),
            ));
        }

        let mut listeners = JoinSet::new();

        for socket in inherited.udp {
            socket.set_nonblocking(true)?;
            let socket = UdpSocket::from_std(socket)?;
            info!("activated on inherited packet socket (UDP)");
            listeners.spawn(serve_udp(self.state.clone(), socket));
        }

        for listener in inherited.tcp {
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            info!("activated on inherited listening socket (TCP)");
            listeners.spawn(serve_tcp(self.state.clone(), listener));
        }

        // Listeners run forever; the first one to return brings the
        // server down.
        match listeners.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(Error::Config(format!("listener task failed: {e}"))),
            None => unreachable!("at least one listener was spawned"),
        }
    }

    /// The address this proxy was configured with.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

async fn serve_udp(state: Arc<ProxyState>, socket: UdpSocket) -> Result<()> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_UDP_QUERY_SIZE];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        let payload = buf[..len].to_vec();
        let state = state.clone();
        let socket = socket.clone();

        tokio::spawn(async move {
            let query = match Message::from_vec(&payload) {
                Ok(query) => query,
                Err(e) => {
                    debug!(%src, error = %e, "dropping malformed UDP query");
                    return;
                }
            };

            let max_size = udp_reply_size(&query);
            if let Some(packed) = handle_query(&state, query, Some(max_size)).await {
                if let Err(e) = socket.send_to(&packed, src).await {
                    debug!(%src, error = %e, "failed to send DNS response");
                }
            }
        });
    }
}

async fn serve_tcp(state: Arc<ProxyState>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, src) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_tcp_conn(&state, stream).await {
                debug!(%src, error = %e, "TCP connection ended with error");
            }
        });
    }
}

/// Serve length-prefixed queries on one TCP connection until the peer
/// closes it.
async fn serve_tcp_conn(state: &ProxyState, mut stream: TcpStream) -> Result<()> {
    while let Some(payload) = exchange::read_frame(&mut stream).await? {
        let query = match Message::from_vec(&payload) {
            Ok(query) => query,
            Err(e) => {
                debug!(error = %e, "dropping connection on malformed TCP query");
                break;
            }
        };

        if let Some(packed) = handle_query(state, query, None).await {
            exchange::write_frame(&mut stream, &packed).await?;
        }
    }
    Ok(())
}

/// Route one query and produce the packed reply.
///
/// `udp_max` carries the client's maximum reply size for UDP transports;
/// TCP passes `None` and replies are written whole.
async fn handle_query(
    state: &ProxyState,
    mut query: Message,
    udp_max: Option<usize>,
) -> Option<Vec<u8>> {
    // We only support single-question queries.
    if query.queries().len() != 1 {
        debug!(questions = query.queries().len(), "failing query");
        return pack_reply(failure_reply(&query), udp_max);
    }

    let name = query.queries()[0].name().to_ascii();

    // A matching override routes the query to its own server.
    if let Some(upstream) = state.overrides.get_most_specific(&name) {
        let Ok(addr) = upstream.parse::<SocketAddr>() else {
            warn!(upstream, "override upstream is not a valid address");
            return pack_reply(failure_reply(&query), udp_max);
        };
        return match exchange::exchange_udp(&query, addr).await {
            Ok(reply) => {
                debug!(name, %addr, "used override upstream");
                pack_reply(reply, udp_max)
            }
            Err(e) => {
                debug!(name, %addr, error = %e, "override upstream error");
                pack_reply(failure_reply(&query), udp_max)
            }
        };
    }

    // Unqualified names (a single label) go to their own upstream when one
    // is configured; they never make sense to send to a public resolver.
    if let Some(addr) = state.unqualified_upstream {
        if label_count(&name) <= 1 {
            return match exchange::exchange_udp(&query, addr).await {
                Ok(reply) => {
                    debug!(name, %addr, "used unqualified upstream");
                    pack_reply(reply, udp_max)
                }
                Err(e) => {
                    debug!(name, %addr, error = %e, "unqualified upstream error");
                    pack_reply(failure_reply(&query), udp_max)
                }
            };
        }
    }

    // Substitute our own ID upstream, in case different clients picked the
    // same one.
    let original_id = query.id();
    query.set_id(reqid::next_id().await);

    match state.resolver.query(&query).await {
        Ok(mut reply) => {
            reply.set_id(original_id);
            pack_reply(reply, udp_max)
        }
        Err(e) => {
            info!(error = %e, "resolver query error");
            query.set_id(original_id);
            pack_reply(failure_reply(&query), udp_max)
        }
    }
}

/// The largest reply this client can take over UDP: 512 bytes unless its
/// EDNS0 OPT advertises another size.
fn udp_reply_size(query: &Message) -> usize {
    query
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload() as usize)
        .unwrap_or(DNS_MIN_UDP_SIZE)
}

fn pack_reply(mut reply: Message, udp_max: Option<usize>) -> Option<Vec<u8>> {
    let packed = match udp_max {
        Some(max) => truncate_packed(&mut reply, max),
        None => reply.to_vec(),
    };
    match packed {
        Ok(packed) => Some(packed),
        Err(e) => {
            warn!(error = %e, "cannot pack reply");
            None
        }
    }
}

/// Pack `reply`, dropping trailing records and setting the TC bit until it
/// fits in `max` bytes.
fn truncate_packed(reply: &mut Message, max: usize) -> std::result::Result<Vec<u8>, ProtoError> {
    let mut packed = reply.to_vec()?;
    if packed.len() <= max {
        return Ok(packed);
    }

    reply.set_truncated(true);
    while packed.len() > max {
        if !drop_last_record(reply) {
            break;
        }
        packed = reply.to_vec()?;
    }
    Ok(packed)
}

/// Remove the last record from the reply, additionals first, then
/// authorities, then answers. Returns false once nothing is left to drop.
fn drop_last_record(reply: &mut Message) -> bool {
    let mut records = reply.take_additionals();
    if records.pop().is_some() {
        reply.insert_additionals(records);
        return true;
    }

    let mut records = reply.take_name_servers();
    if records.pop().is_some() {
        reply.insert_name_servers(records);
        return true;
    }

    let mut records = reply.take_answers();
    if records.pop().is_some() {
        reply.insert_answers(records);
        return true;
    }

    false
}

/// SERVFAIL reply for the given request.
fn failure_reply(req: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_recursion_desired(req.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(ResponseCode::ServFail);
    reply.add_queries(req.queries().to_vec());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, Query};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    fn query_a(name: &str) -> Message {
        let mut req = Message::new();
        req.set_id(99);
        req.add_query(Query::query(Name::from_utf8(name).unwrap(), RecordType::A));
        req
    }

    fn bulky_reply(txt_records: usize) -> Message {
        let mut reply = Message::new();
        reply.set_id(7);
        reply.set_message_type(MessageType::Response);
        reply.add_query(Query::query(
            Name::from_utf8("big.test.").unwrap(),
            RecordType::TXT,
        ));
        for i in 0..txt_records {
            reply.add_answer(Record::from_rdata(
                Name::from_utf8("big.test.").unwrap(),
                300,
                RData::TXT(TXT::new(vec![format!("padding-{i}-{}", "x".repeat(80))])),
            ));
        }
        reply
    }

    #[test]
    fn test_failure_reply() {
        let req = query_a("failing.test.");
        let reply = failure_reply(&req);

        assert_eq!(reply.id(), req.id());
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.queries(), req.queries());
    }

    #[test]
    fn test_udp_reply_size_default() {
        assert_eq!(udp_reply_size(&query_a("test.")), DNS_MIN_UDP_SIZE);
    }

    #[test]
    fn test_udp_reply_size_edns() {
        let mut req = query_a("test.");
        let mut edns = Edns::new();
        edns.set_max_payload(2048);
        *req.extensions_mut() = Some(edns);
        assert_eq!(udp_reply_size(&req), 2048);
    }

    #[test]
    fn test_truncate_fits_exactly() {
        let mut reply = bulky_reply(3);
        let exact = reply.to_vec().unwrap().len();

        let packed = truncate_packed(&mut reply, exact).unwrap();
        assert_eq!(packed.len(), exact);

        let unpacked = Message::from_vec(&packed).unwrap();
        assert!(!unpacked.truncated());
        assert_eq!(unpacked.answers().len(), 3);
    }

    #[test]
    fn test_truncate_one_byte_over() {
        let mut reply = bulky_reply(3);
        let exact = reply.to_vec().unwrap().len();

        let packed = truncate_packed(&mut reply, exact - 1).unwrap();
        assert!(packed.len() < exact);

        let unpacked = Message::from_vec(&packed).unwrap();
        assert!(unpacked.truncated());
        assert!(unpacked.answers().len() < 3);
    }

    #[test]
    fn test_truncate_large_reply_to_512() {
        let mut reply = bulky_reply(10);
        assert!(reply.to_vec().unwrap().len() > DNS_MIN_UDP_SIZE);

        let packed = truncate_packed(&mut reply, DNS_MIN_UDP_SIZE).unwrap();
        assert!(packed.len() <= DNS_MIN_UDP_SIZE);
        assert!(Message::from_vec(&packed).unwrap().truncated());
    }

    #[test]
    fn test_drop_last_record_order() {
        let mut reply = bulky_reply(1);
        reply.insert_name_servers(vec![Record::from_rdata(
            Name::from_utf8("ns.test.").unwrap(),
            300,
            RData::TXT(TXT::new(vec!["ns".into()])),
        )]);
        reply.insert_additionals(vec![Record::from_rdata(
            Name::from_utf8("extra.test.").unwrap(),
            300,
            RData::TXT(TXT::new(vec!["extra".into()])),
        )]);

        assert!(drop_last_record(&mut reply));
        assert!(reply.additionals().is_empty());
        assert_eq!(reply.name_servers().len(), 1);

        assert!(drop_last_record(&mut reply));
        assert!(reply.name_servers().is_empty());
        assert_eq!(reply.answers().len(), 1);

        assert!(drop_last_record(&mut reply));
        assert!(!drop_last_record(&mut reply));
    }
}
