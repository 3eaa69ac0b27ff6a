//! DNS Forwarder
//!
//! Serves DNS on the host DNS listen addresses and answers every query by
//! resolving it against the upstream servers currently published by the
//! resolver status. Message handling is done by hickory-server; upstream
//! exchange, caching and truncation fallback by hickory-resolver.

use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::Record;
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use parking_lot::RwLock;
use std::fmt;
use std::iter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Forwarder tunables
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Per-upstream exchange timeout
    pub upstream_timeout: Duration,
    /// Attempts per upstream before the query fails
    pub upstream_attempts: usize,
    /// Idle timeout of client TCP connections
    pub tcp_idle_timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(2),
            upstream_attempts: 1,
            tcp_idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Listener transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const ALL: [Transport; 2] = [Transport::Tcp, Transport::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared, swappable upstream list
#[derive(Debug, Clone, Default)]
pub struct Upstreams {
    inner: Arc<RwLock<Vec<SocketAddr>>>,
}

impl Upstreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the upstream list; false when nothing changed
    pub fn set(&self, upstreams: Vec<SocketAddr>) -> bool {
        let mut current = self.inner.write();

        if *current == upstreams {
            return false;
        }

        *current = upstreams;
        true
    }

    pub fn get(&self) -> Vec<SocketAddr> {
        self.inner.read().clone()
    }
}

// =============================================================================
// Upstream Resolver
// =============================================================================

/// Resolver for `upstreams`; UDP listeners may fall back to TCP upstreams
fn build_resolver(transport: Transport, upstreams: &[SocketAddr], config: &DnsConfig) -> TokioResolver {
    let mut resolver_config = ResolverConfig::new();

    for addr in upstreams {
        if transport == Transport::Udp {
            resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
        }
        resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Tcp));
    }

    let mut opts = ResolverOpts::default();
    opts.timeout = config.upstream_timeout;
    opts.attempts = config.upstream_attempts;
    opts.edns0 = true;
    opts.preserve_intermediates = true;

    TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
        .with_options(opts)
        .build()
}

/// Result of resolving one question upstream
struct Answer {
    code: ResponseCode,
    records: Vec<Record>,
}

struct ForwardHandler {
    transport: Transport,
    upstreams: Upstreams,
    config: DnsConfig,
    /// Resolver for the upstream list it was built from
    resolver: RwLock<Option<(Vec<SocketAddr>, TokioResolver)>>,
}

impl ForwardHandler {
    fn new(transport: Transport, upstreams: Upstreams, config: DnsConfig) -> Self {
        Self {
            transport,
            upstreams,
            config,
            resolver: RwLock::new(None),
        }
    }

    /// Resolver for the current upstreams, rebuilt when the list changed
    fn resolver(&self) -> Option<TokioResolver> {
        let upstreams = self.upstreams.get();

        if upstreams.is_empty() {
            return None;
        }

        if let Some((current, resolver)) = &*self.resolver.read() {
            if *current == upstreams {
                return Some(resolver.clone());
            }
        }

        debug!(transport = %self.transport, upstreams = ?upstreams, "rebuilding dns resolver");

        let resolver = build_resolver(self.transport, &upstreams, &self.config);
        *self.resolver.write() = Some((upstreams, resolver.clone()));

        Some(resolver)
    }

    async fn resolve(&self, request: &Request) -> Result<Answer> {
        let info = request
            .request_info()
            .map_err(|e| Error::Dns(format!("malformed request: {}", e)))?;

        let resolver = self
            .resolver()
            .ok_or_else(|| Error::Configuration("no upstream DNS servers".into()))?;

        let name = info.query.original().name().clone();
        let record_type = info.query.query_type();

        match resolver.lookup(name, record_type).await {
            Ok(lookup) => Ok(Answer {
                code: ResponseCode::NoError,
                records: lookup.records().to_vec(),
            }),
            Err(e) if e.is_nx_domain() => Ok(Answer {
                code: ResponseCode::NXDomain,
                records: Vec::new(),
            }),
            Err(e) if e.is_no_records_found() => Ok(Answer {
                code: ResponseCode::NoError,
                records: Vec::new(),
            }),
            Err(e) => Err(Error::Dns(e.to_string())),
        }
    }
}

#[async_trait]
impl RequestHandler for ForwardHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);

        let sent = match self.resolve(request).await {
            Ok(answer) => {
                let mut header = Header::response_from_request(request.header());
                header.set_recursion_available(true);
                header.set_response_code(answer.code);

                let response = builder.build(
                    header,
                    answer.records.iter(),
                    iter::empty(),
                    iter::empty(),
                    iter::empty(),
                );
                response_handle.send_response(response).await
            }
            Err(e) => {
                debug!(transport = %self.transport, error = %e, "dns forward failed");

                let response = builder.error_msg(request.header(), ResponseCode::ServFail);
                response_handle.send_response(response).await
            }
        };

        sent.unwrap_or_else(|e| {
            debug!(transport = %self.transport, error = %e, "dns reply failed");

            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        })
    }
}

// =============================================================================
// Server
// =============================================================================

/// Running forwarder of one transport on a set of listen addresses
pub struct DnsServer {
    transport: Transport,
    local_addrs: Vec<SocketAddr>,
    server: ServerFuture<ForwardHandler>,
}

impl DnsServer {
    /// Bind every listen address and start serving
    ///
    /// A failed bind drops the listeners registered so far.
    pub async fn start(
        transport: Transport,
        listen: &[SocketAddr],
        upstreams: Upstreams,
        config: DnsConfig,
    ) -> Result<Self> {
        let tcp_idle_timeout = config.tcp_idle_timeout;
        let mut server = ServerFuture::new(ForwardHandler::new(transport, upstreams, config));
        let mut local_addrs = Vec::new();

        for addr in listen {
            let bound = async {
                match transport {
                    Transport::Udp => {
                        let socket = UdpSocket::bind(addr).await?;
                        local_addrs.push(socket.local_addr()?);
                        server.register_socket(socket);
                    }
                    Transport::Tcp => {
                        let listener = TcpListener::bind(addr).await?;
                        local_addrs.push(listener.local_addr()?);
                        server.register_listener(listener, tcp_idle_timeout);
                    }
                }

                Ok::<_, Error>(())
            }
            .await;

            bound.context(format!("binding dns {} listener {}", transport, addr))?;
        }

        info!(transport = %transport, addrs = ?local_addrs, "dns forwarder started");

        Ok(Self {
            transport,
            local_addrs,
            server,
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub async fn stop(mut self) {
        if let Err(e) = self.server.shutdown_gracefully().await {
            warn!(transport = %self.transport, error = %e, "dns forwarder shutdown failed");
        }

        info!(transport = %self.transport, "dns forwarder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn query(id: u16, name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    /// Upstream answering A queries for `example.com.` and NXDOMAIN otherwise
    async fn fake_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
                let request = Message::from_vec(&buf[..n]).unwrap();

                let mut reply = Message::new();
                reply
                    .set_id(request.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(true)
                    .set_recursion_available(true)
                    .add_queries(request.queries().to_vec());

                let question = request.queries()[0].clone();
                if question.name() == &Name::from_ascii("example.com.").unwrap() {
                    if question.query_type() == RecordType::A {
                        reply.add_answer(Record::from_rdata(
                            question.name().clone(),
                            300,
                            RData::A(A::new(192, 0, 2, 10)),
                        ));
                    }
                } else {
                    reply.set_response_code(ResponseCode::NXDomain);
                }

                socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
            }
        });

        addr
    }

    async fn ask_udp(server: &DnsServer, request: &[u8]) -> Message {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(request, server.local_addrs()[0]).await.unwrap();

        let mut buf = [0u8; 4096];
        let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        Message::from_vec(&buf[..n]).unwrap()
    }

    async fn udp_server(upstreams: Upstreams) -> DnsServer {
        DnsServer::start(
            Transport::Udp,
            &["127.0.0.1:0".parse().unwrap()],
            upstreams,
            DnsConfig::default(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_upstreams_set_reports_change() {
        let upstreams = Upstreams::new();
        let addr: SocketAddr = "1.1.1.1:53".parse().unwrap();

        assert!(upstreams.set(vec![addr]));
        assert!(!upstreams.set(vec![addr]));
        assert_eq!(upstreams.get(), vec![addr]);
    }

    #[tokio::test]
    async fn test_udp_forwarding() {
        let upstreams = Upstreams::new();
        upstreams.set(vec![fake_upstream().await]);

        let server = udp_server(upstreams).await;
        assert_eq!(server.transport(), Transport::Udp);

        let reply = ask_udp(&server, &query(7, "example.com.")).await;

        assert_eq!(reply.id(), 7);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].record_type(), RecordType::A);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_nxdomain_is_relayed() {
        let upstreams = Upstreams::new();
        upstreams.set(vec![fake_upstream().await]);

        let server = udp_server(upstreams).await;
        let reply = ask_udp(&server, &query(8, "missing.test.")).await;

        assert_eq!(reply.id(), 8);
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);
        assert!(reply.answers().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_upstream_swap_takes_effect() {
        let upstreams = Upstreams::new();
        let server = udp_server(upstreams.clone()).await;

        let reply = ask_udp(&server, &query(1, "example.com.")).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);

        upstreams.set(vec![fake_upstream().await]);

        let reply = ask_udp(&server, &query(2, "example.com.")).await;
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_servfail_without_upstreams() {
        let server = DnsServer::start(
            Transport::Tcp,
            &["127.0.0.1:0".parse().unwrap()],
            Upstreams::new(),
            DnsConfig::default(),
        )
        .await
        .unwrap();

        let request = query(9, "example.com.");
        let mut stream = TcpStream::connect(server.local_addrs()[0]).await.unwrap();
        stream.write_u16(request.len() as u16).await.unwrap();
        stream.write_all(&request).await.unwrap();

        let reply = timeout(Duration::from_secs(5), async {
            let len = stream.read_u16().await.unwrap() as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        })
        .await
        .unwrap();

        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.id(), 9);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = DnsServer::start(Transport::Udp, &[addr], Upstreams::new(), DnsConfig::default())
            .await
            .err()
            .unwrap();

        assert!(err.to_string().contains("binding dns udp listener"));
    }
}
