//! End-to-end tests for the DNS front-end: routing, ID handling, and UDP
//! truncation, against stub upstreams bound to ephemeral localhost ports.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

use rudoh_dns::error::{Error, Result};
use rudoh_dns::{exchange, DnsProxy, DomainMap, Resolver};

/// Grab a free localhost port. Not race-free, but good enough for tests.
fn free_port_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Serve a static answer for every query, like a tiny authoritative
/// server.
async fn serve_static_dns(socket: UdpSocket, record_name: &'static str, ip: Ipv4Addr) {
    let mut buf = vec![0u8; 4096];
    loop {
        let Ok((len, src)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(query) = Message::from_vec(&buf[..len]) else {
            continue;
        };

        let mut reply = Message::new();
        reply.set_id(query.id());
        reply.set_message_type(MessageType::Response);
        reply.set_response_code(ResponseCode::NoError);
        reply.add_queries(query.queries().to_vec());
        reply.add_answer(Record::from_rdata(
            Name::from_utf8(record_name).unwrap(),
            3600,
            RData::A(A(ip)),
        ));

        let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
    }
}

async fn start_static_dns(record_name: &'static str, ip: Ipv4Addr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(serve_static_dns(socket, record_name, ip));
    addr
}

/// Resolver with a canned answer, recording what it is asked.
#[derive(Default)]
struct TestResolver {
    answer: Option<(String, Ipv4Addr)>,
    txt_answers: usize,
    fail: bool,
    queries: AtomicUsize,
    last_id: AtomicU16,
}

#[async_trait]
impl Resolver for TestResolver {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn maintain(&self) {}

    async fn query(&self, req: &Message) -> Result<Message> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.last_id.store(req.id(), Ordering::SeqCst);

        if self.fail {
            return Err(Error::Transport("stub resolver failure".into()));
        }

        let mut reply = Message::new();
        reply.set_id(req.id());
        reply.set_message_type(MessageType::Response);
        reply.set_response_code(ResponseCode::NoError);
        reply.add_queries(req.queries().to_vec());

        if let Some((name, ip)) = &self.answer {
            reply.add_answer(Record::from_rdata(
                Name::from_utf8(name).unwrap(),
                3600,
                RData::A(A(*ip)),
            ));
        }
        for i in 0..self.txt_answers {
            reply.add_answer(Record::from_rdata(
                Name::from_utf8("big.test.").unwrap(),
                300,
                RData::TXT(TXT::new(vec![format!("filler-{i}-{}", "x".repeat(80))])),
            ));
        }
        Ok(reply)
    }
}

async fn start_proxy(
    resolver: Arc<dyn Resolver>,
    unqualified: Option<SocketAddr>,
    overrides: DomainMap,
) -> SocketAddr {
    let addr = free_port_addr();
    let proxy = DnsProxy::new(addr.clone(), resolver, unqualified, overrides);
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    let addr: SocketAddr = addr.parse().unwrap();
    wait_for_dns_server(addr).await;
    addr
}

/// Poke the server until it answers; gives it five seconds to come up.
async fn wait_for_dns_server(addr: SocketAddr) {
    let req = query_a("startup.poke.", 1);
    for _ in 0..50 {
        let attempt = tokio::time::timeout(Duration::from_millis(100), exchange::exchange_udp(&req, addr));
        if let Ok(Ok(_)) = attempt.await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("DNS server at {addr} did not come up");
}

fn query_a(name: &str, id: u16) -> Message {
    let mut req = Message::new();
    req.set_id(id);
    req.add_query(Query::query(Name::from_utf8(name).unwrap(), RecordType::A));
    req
}

fn first_a(reply: &Message) -> Option<Ipv4Addr> {
    reply.answers().iter().find_map(|r| match r.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}

#[tokio::test]
async fn test_resolver_path_preserves_client_id() {
    let resolver = Arc::new(TestResolver {
        answer: Some(("response.test.".into(), Ipv4Addr::new(1, 1, 1, 1))),
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver.clone(), None, DomainMap::new()).await;

    let reply = exchange::exchange_udp(&query_a("response.test.", 4242), proxy_addr)
        .await
        .unwrap();

    assert_eq!(reply.id(), 4242, "client must get its own ID back");
    assert_eq!(first_a(&reply), Some(Ipv4Addr::new(1, 1, 1, 1)));

    let upstream_id_1 = resolver.last_id.load(Ordering::SeqCst);

    exchange::exchange_udp(&query_a("response.test.", 4242), proxy_addr)
        .await
        .unwrap();
    let upstream_id_2 = resolver.last_id.load(Ordering::SeqCst);

    // Upstream IDs are freshly generated; both matching the client's pick
    // would mean no rewriting happened.
    assert!(
        upstream_id_1 != 4242 || upstream_id_2 != 4242,
        "upstream queries appear to reuse the client ID"
    );
}

#[tokio::test]
async fn test_override_routes_by_suffix_case_insensitively() {
    let override_addr = start_static_dns("a.ov.", Ipv4Addr::new(3, 3, 3, 3)).await;

    let mut overrides = DomainMap::new();
    overrides.set("ov.", &override_addr.to_string());

    let resolver = Arc::new(TestResolver {
        answer: Some(("response.test.".into(), Ipv4Addr::new(1, 1, 1, 1))),
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver.clone(), None, overrides).await;
    let queries_after_startup = resolver.queries.load(Ordering::SeqCst);

    let reply = exchange::exchange_udp(&query_a("y.x.OV.", 7), proxy_addr)
        .await
        .unwrap();

    assert_eq!(first_a(&reply), Some(Ipv4Addr::new(3, 3, 3, 3)));
    assert_eq!(
        resolver.queries.load(Ordering::SeqCst),
        queries_after_startup,
        "override queries must not reach the resolver"
    );
}

#[tokio::test]
async fn test_unqualified_shortcut() {
    let unq_addr = start_static_dns("unq.", Ipv4Addr::new(2, 2, 2, 2)).await;

    let resolver = Arc::new(TestResolver {
        answer: Some(("response.test.".into(), Ipv4Addr::new(1, 1, 1, 1))),
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver.clone(), Some(unq_addr), DomainMap::new()).await;
    let queries_after_startup = resolver.queries.load(Ordering::SeqCst);

    // One label: shortcut.
    let reply = exchange::exchange_udp(&query_a("unqualified.", 8), proxy_addr)
        .await
        .unwrap();
    assert_eq!(first_a(&reply), Some(Ipv4Addr::new(2, 2, 2, 2)));
    assert_eq!(resolver.queries.load(Ordering::SeqCst), queries_after_startup);

    // Two labels: normal path.
    let reply = exchange::exchange_udp(&query_a("two.labels.", 9), proxy_addr)
        .await
        .unwrap();
    assert_eq!(first_a(&reply), Some(Ipv4Addr::new(1, 1, 1, 1)));
    assert_eq!(
        resolver.queries.load(Ordering::SeqCst),
        queries_after_startup + 1
    );
}

#[tokio::test]
async fn test_resolver_error_yields_servfail_with_original_id() {
    let resolver = Arc::new(TestResolver {
        fail: true,
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver, None, DomainMap::new()).await;

    let reply = exchange::exchange_udp(&query_a("broken.test.", 31337), proxy_addr)
        .await
        .unwrap();

    assert_eq!(reply.response_code(), ResponseCode::ServFail);
    assert_eq!(reply.id(), 31337);
}

#[tokio::test]
async fn test_unreachable_upstreams_yield_servfail() {
    // Get addresses but start nothing on them.
    let dead_addr: SocketAddr = free_port_addr().parse().unwrap();

    let mut overrides = DomainMap::new();
    overrides.set("one.fallback.", &dead_addr.to_string());

    let resolver = Arc::new(TestResolver {
        answer: Some(("response.test.".into(), Ipv4Addr::new(1, 1, 1, 1))),
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver, Some(dead_addr), overrides).await;

    for name in ["one.fallback.", "unqualified."] {
        let reply = exchange::exchange_udp(&query_a(name, 5), proxy_addr)
            .await
            .unwrap();
        assert_eq!(
            reply.response_code(),
            ResponseCode::ServFail,
            "query for {name}"
        );
    }
}

/// Send raw bytes over UDP and return the raw reply, so tests can check
/// on-the-wire sizes.
async fn raw_udp_query(server: SocketAddr, req: &Message) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket.send(&req.to_vec().unwrap()).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let len = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
async fn test_udp_truncation() {
    let resolver = Arc::new(TestResolver {
        txt_answers: 10,
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver, None, DomainMap::new()).await;

    // No EDNS0: the reply must fit in 512 bytes and carry TC.
    let raw = raw_udp_query(proxy_addr, &query_a("big.test.", 1)).await;
    assert!(raw.len() <= 512, "reply is {} bytes", raw.len());
    let reply = Message::from_vec(&raw).unwrap();
    assert!(reply.truncated());

    // EDNS0 with a 2048-byte buffer: untruncated.
    let mut req = query_a("big.test.", 2);
    let mut edns = Edns::new();
    edns.set_max_payload(2048);
    *req.extensions_mut() = Some(edns);

    let raw = raw_udp_query(proxy_addr, &req).await;
    assert!(raw.len() > 512);
    let reply = Message::from_vec(&raw).unwrap();
    assert!(!reply.truncated());
    assert_eq!(reply.answers().len(), 10);
}

#[tokio::test]
async fn test_only_single_question_queries_are_served() {
    let resolver = Arc::new(TestResolver {
        answer: Some(("response.test.".into(), Ipv4Addr::new(1, 1, 1, 1))),
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver.clone(), None, DomainMap::new()).await;
    let queries_after_startup = resolver.queries.load(Ordering::SeqCst);

    // No questions at all.
    let mut req = Message::new();
    req.set_id(77);

    let raw = raw_udp_query(proxy_addr, &req).await;
    let reply = Message::from_vec(&raw).unwrap();
    assert_eq!(reply.response_code(), ResponseCode::ServFail);
    assert_eq!(reply.id(), 77);

    // Two questions.
    let mut req = query_a("one.test.", 78);
    req.add_query(Query::query(
        Name::from_utf8("two.test.").unwrap(),
        RecordType::A,
    ));

    let raw = raw_udp_query(proxy_addr, &req).await;
    let reply = Message::from_vec(&raw).unwrap();
    assert_eq!(reply.response_code(), ResponseCode::ServFail);
    assert_eq!(reply.id(), 78);

    assert_eq!(
        resolver.queries.load(Ordering::SeqCst),
        queries_after_startup,
        "malformed queries must not reach the resolver"
    );
}

#[tokio::test]
async fn test_tcp_serves_multiple_queries_per_connection() {
    let resolver = Arc::new(TestResolver {
        answer: Some(("response.test.".into(), Ipv4Addr::new(1, 1, 1, 1))),
        ..Default::default()
    });
    let proxy_addr = start_proxy(resolver, None, DomainMap::new()).await;

    let mut stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();

    for id in [21u16, 22, 23] {
        let req = query_a("response.test.", id);
        exchange::write_frame(&mut stream, &req.to_vec().unwrap())
            .await
            .unwrap();

        let payload = exchange::read_frame(&mut stream)
            .await
            .unwrap()
            .expect("connection closed early");
        let reply = Message::from_vec(&payload).unwrap();
        assert_eq!(reply.id(), id);
        assert_eq!(first_a(&reply), Some(Ipv4Addr::new(1, 1, 1, 1)));
    }
}
