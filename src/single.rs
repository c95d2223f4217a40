//! A DNS transport to a single upstream server.
//!
//! This module provides [`Connection`], an [`Upstream`] implementation
//! that owns one server endpoint and performs one DNS transaction per
//! [`query`][Upstream::query] call. Queries go over UDP first and fall
//! back to TCP on truncation; retries across attempts are the business
//! of the multi-server engine in [`multi`][crate::multi].

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::message_builder::{MessageBuilder, StaticCompressor};
use domain::base::name::ParsedName;
use domain::base::{Message, Rtype};
use domain::rdata::tsig::Time48;
use domain::rdata::AllRecordData;
use domain::tsig::{self, ClientTransaction};
use octseq::Octets;
use parking_lot::Mutex;
use std::boxed::Box;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::request::{Error, Upstream};

/// The default amount of time to wait for a reply to one attempt.
///
/// Deliberately short so that retry pressure across the server set
/// builds quickly within a typical caller timeout.
pub const QUANTUM: Duration = Duration::from_secs(20);

/// Default EDNS(0) UDP payload size. See
/// draft-ietf-dnsop-avoid-fragmentation for discussion.
const DEF_UDP_PAYLOAD_SIZE: u16 = 1232;

/// Receive buffer size for responses to queries without an OPT record.
const MIN_RECV_SIZE: usize = 512;

//------------ Config ---------------------------------------------------------

/// Configuration of a connection to one upstream server.
#[derive(Clone, Debug)]
pub struct Config {
    /// The port to send queries to.
    pub port: u16,

    /// Send queries over TCP by default.
    pub use_tcp: bool,

    /// Return truncated responses instead of retrying over TCP.
    pub ignore_truncation: bool,

    /// The EDNS version for outgoing messages, if any.
    pub edns: Option<u8>,

    /// The UDP payload size advertised in the OPT record.
    pub udp_payload_size: u16,

    /// The key queries are signed with, if any.
    pub tsig_key: Option<Arc<tsig::Key>>,

    /// How long to wait for a reply to one attempt.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 53,
            use_tcp: false,
            ignore_truncation: false,
            edns: None,
            udp_payload_size: DEF_UDP_PAYLOAD_SIZE,
            tsig_key: None,
            timeout: QUANTUM,
        }
    }
}

//------------ Connection -----------------------------------------------------

/// A connection to a single upstream server.
///
/// One transaction per [`query`][Upstream::query] call: the message is
/// re-composed with a fresh random id and the configured EDNS and TSIG
/// decorations, sent over the configured transport, and the reply is
/// matched back against the query. The whole attempt is bounded by the
/// configured timeout; expiry is reported as [`Error::Timeout`], the
/// one transient error kind.
#[derive(Debug)]
pub struct Connection {
    /// The address of the server.
    addr: IpAddr,

    /// Configuration, shared with the setters.
    config: Mutex<Config>,
}

impl Connection {
    /// Creates a connection to the given server with default settings.
    pub fn new(addr: IpAddr) -> Self {
        Self::with_config(addr, Config::default())
    }

    /// Creates a connection with the given configuration.
    pub fn with_config(addr: IpAddr, config: Config) -> Self {
        Self {
            addr,
            config: Mutex::new(config),
        }
    }

    /// Returns the address of the server.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Performs one transaction against the server.
    async fn request(
        &self,
        msg: Message<Vec<u8>>,
    ) -> Result<Message<Bytes>, Error> {
        let config = self.config.lock().clone();
        let server = SocketAddr::new(self.addr, config.port);
        match timeout(config.timeout, exchange(msg, server, &config)).await
        {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Upstream for Connection {
    fn query(
        &self,
        msg: Message<Vec<u8>>,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_,
        >,
    > {
        Box::pin(self.request(msg))
    }

    fn set_port(&self, port: u16) {
        self.config.lock().port = port;
    }

    fn set_tcp(&self, enable: bool) {
        self.config.lock().use_tcp = enable;
    }

    fn set_ignore_truncation(&self, enable: bool) {
        self.config.lock().ignore_truncation = enable;
    }

    fn set_edns(&self, version: Option<u8>) {
        self.config.lock().edns = version;
    }

    fn set_tsig_key(&self, key: Option<Arc<tsig::Key>>) {
        self.config.lock().tsig_key = key;
    }

    fn set_timeout(&self, timeout: Duration) {
        self.config.lock().timeout = timeout;
    }
}

//------------ Transaction pieces ---------------------------------------------

/// Runs the prepared exchange over the configured transports.
async fn exchange(
    msg: Message<Vec<u8>>,
    server: SocketAddr,
    config: &Config,
) -> Result<Message<Bytes>, Error> {
    let (query, tran) = prepare(&msg, config)?;
    if config.use_tcp {
        let reply = stream_exchange(&query, server).await?;
        return finish(reply, &tran);
    }
    let reply = dgram_exchange(&query, server, config).await?;
    if reply.header().tc() && !config.ignore_truncation {
        let reply = stream_exchange(&query, server).await?;
        return finish(reply, &tran);
    }
    finish(reply, &tran)
}

/// Re-composes the caller's message for the wire.
///
/// The copy gets a fresh random id, an OPT record according to the EDNS
/// configuration (any OPT of the caller is dropped), and a TSIG record
/// when a key is configured. Returns the message together with the
/// transaction needed to verify a signed reply.
fn prepare(
    msg: &Message<Vec<u8>>,
    config: &Config,
) -> Result<
    (Message<Vec<u8>>, Option<ClientTransaction<Arc<tsig::Key>>>),
    Error,
> {
    let mut target =
        MessageBuilder::from_target(StaticCompressor::new(Vec::new()))
            .map_err(|_| Error::Push)?;

    *target.header_mut() = msg.header();
    target.header_mut().set_random_id();

    let source = msg.question();
    let mut target = target.question();
    for question in source {
        target.push(question.map_err(|_| Error::Parse)?)?;
    }

    let mut source = source.answer().map_err(|_| Error::Parse)?;
    let mut target = target.answer();
    for record in &mut source {
        let record = record
            .map_err(|_| Error::Parse)?
            .into_record::<AllRecordData<_, ParsedName<_>>>()
            .map_err(|_| Error::Parse)?
            .ok_or(Error::Parse)?;
        target.push(record)?;
    }

    let mut source = source
        .next_section()
        .map_err(|_| Error::Parse)?
        .ok_or(Error::Parse)?;
    let mut target = target.authority();
    for record in &mut source {
        let record = record
            .map_err(|_| Error::Parse)?
            .into_record::<AllRecordData<_, ParsedName<_>>>()
            .map_err(|_| Error::Parse)?
            .ok_or(Error::Parse)?;
        target.push(record)?;
    }

    let source = source
        .next_section()
        .map_err(|_| Error::Parse)?
        .ok_or(Error::Parse)?;
    let mut target = target.additional();
    for record in source {
        let record = record.map_err(|_| Error::Parse)?;
        if record.rtype() == Rtype::OPT {
            continue;
        }
        let record = record
            .into_record::<AllRecordData<_, ParsedName<_>>>()
            .map_err(|_| Error::Parse)?
            .ok_or(Error::Parse)?;
        target.push(record)?;
    }

    if let Some(version) = config.edns {
        target.opt(|opt| {
            opt.set_udp_payload_size(config.udp_payload_size);
            opt.set_version(version);
            Ok(())
        })?;
    }

    let tran = match config.tsig_key.as_ref() {
        Some(key) => Some(
            ClientTransaction::request(
                key.clone(),
                &mut target,
                Time48::now(),
            )
            .map_err(|_| Error::TsigSign)?,
        ),
        None => None,
    };

    let msg = Message::from_octets(target.finish().into_target())
        .map_err(|_| Error::Parse)?;
    Ok((msg, tran))
}

/// Verifies a reply when the exchange is signed and freezes the octets.
fn finish(
    mut reply: Message<Vec<u8>>,
    tran: &Option<ClientTransaction<Arc<tsig::Key>>>,
) -> Result<Message<Bytes>, Error> {
    if let Some(tran) = tran {
        tran.answer(&mut reply, Time48::now())
            .map_err(|err| Error::TsigVerify(Arc::new(err)))?;
    }
    Message::from_octets(Bytes::from(reply.into_octets()))
        .map_err(|_| Error::Parse)
}

/// One UDP exchange: send once, receive until a reply matches.
///
/// Datagrams that do not parse or do not belong to the query are
/// ignored; the attempt timeout bounds the whole thing.
async fn dgram_exchange(
    query: &Message<Vec<u8>>,
    server: SocketAddr,
    config: &Config,
) -> Result<Message<Vec<u8>>, Error> {
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(local)
        .await
        .map_err(|err| Error::Connect(Arc::new(err)))?;
    sock.connect(server)
        .await
        .map_err(|err| Error::Connect(Arc::new(err)))?;

    let dgram = query.as_slice();
    let sent = sock
        .send(dgram)
        .await
        .map_err(|err| Error::Send(Arc::new(err)))?;
    if sent != dgram.len() {
        return Err(Error::ShortSend);
    }

    let recv_size = if config.edns.is_some() {
        usize::from(config.udp_payload_size).max(MIN_RECV_SIZE)
    } else {
        MIN_RECV_SIZE
    };
    loop {
        let mut buf = vec![0u8; recv_size];
        let len = sock
            .recv(&mut buf)
            .await
            .map_err(|err| Error::Receive(Arc::new(err)))?;
        buf.truncate(len);
        let reply = match Message::from_octets(buf) {
            Ok(reply) => reply,
            Err(_) => continue,
        };
        if !is_answer(&reply, query) {
            continue;
        }
        return Ok(reply);
    }
}

/// One TCP exchange with 2-octet length framing.
async fn stream_exchange(
    query: &Message<Vec<u8>>,
    server: SocketAddr,
) -> Result<Message<Vec<u8>>, Error> {
    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|err| Error::Connect(Arc::new(err)))?;

    let dgram = query.as_slice();
    let len = u16::try_from(dgram.len()).map_err(|_| Error::LongMessage)?;
    let mut frame = Vec::with_capacity(dgram.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(dgram);
    stream
        .write_all(&frame)
        .await
        .map_err(|err| Error::Send(Arc::new(err)))?;

    let mut len = [0u8; 2];
    stream
        .read_exact(&mut len)
        .await
        .map_err(|err| Error::Receive(Arc::new(err)))?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|err| Error::Receive(Arc::new(err)))?;

    let reply = Message::from_octets(buf).map_err(|_| Error::Parse)?;
    if !is_answer(&reply, query) {
        return Err(Error::WrongReply);
    }
    Ok(reply)
}

/// Checks whether a message is a valid reply for a query.
///
/// The question section may be empty if the reply is truncated or
/// reports an error, provided all other sections are empty as well.
fn is_answer<QueryOcts, ReplyOcts>(
    reply: &Message<ReplyOcts>,
    query: &Message<QueryOcts>,
) -> bool
where
    QueryOcts: AsRef<[u8]> + Octets,
    ReplyOcts: AsRef<[u8]> + Octets,
{
    let reply_header = reply.header();
    let reply_hcounts = reply.header_counts();

    if !reply_header.qr() || reply_header.id() != query.header().id() {
        return false;
    }

    if (reply_header.tc() || reply_header.rcode() != Rcode::NOERROR)
        && reply_hcounts.qdcount() == 0
        && reply_hcounts.ancount() == 0
        && reply_hcounts.nscount() == 0
        && reply_hcounts.arcount() == 0
    {
        return true;
    }

    if reply_hcounts.qdcount() != query.header_counts().qdcount() {
        false
    } else {
        reply.question() == query.question()
    }
}

//============ Testing ======================================================
