//! Multiplexing queries over a set of upstream servers.
//!
//! This module offers [`Resolver`], a client-side engine that owns a set
//! of equivalent upstream servers and dispatches every query against all
//! of them. Dispatch starts staggered so that the first server gets a
//! head start, each server is retried a bounded number of times, and the
//! responses that come back are arbitrated: a `NOERROR` response wins
//! immediately, an authoritative `NXDOMAIN` beats other failures, and if
//! nothing better ever arrives the first I/O error observed is reported.
//!
//! The per-server transport is anything implementing [`Upstream`];
//! [`Resolver`] implements the trait itself, so resolvers can be nested
//! as members of other resolvers.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::Message;
use domain::tsig;
use parking_lot::RwLock;
use std::boxed::Box;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::trace;

use crate::conf::ResolvConf;
use crate::request::{Error, GetResponse, Upstream};
use crate::single;

/// Default number of attempts per server per query.
const DEF_RETRIES: usize = 3;

/// Head start granted to a dispatched server before the next one is
/// tried.
///
/// While an untried server remains, the wait for responses is bounded by
/// this interval; dispatch order is preserved but an unresponsive server
/// cannot hold up the fan-out.
const STAGGER: Duration = Duration::from_millis(1);

/// Process-wide source of unique attempt identifiers.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

//------------ Resolver -------------------------------------------------------

/// A DNS resolver dispatching queries over multiple upstream servers.
///
/// Resolver values can be cloned cheaply; all state lives behind an arc
/// and clones drive the same upstream set.
#[derive(Clone, Debug)]
pub struct Resolver {
    /// The shared state driven by all clones.
    inner: Arc<Inner>,
}

/// The state shared by clones of a [`Resolver`].
#[derive(Debug)]
struct Inner {
    /// The current set of upstream servers.
    ///
    /// Servers are occasionally added and removed but every query takes
    /// a snapshot, so reads dominate.
    upstreams: RwLock<Vec<Arc<dyn Upstream>>>,

    /// Maximum number of attempts per server per query.
    retries: AtomicUsize,

    /// Whether the starting server rotates across queries.
    load_balance: AtomicBool,

    /// Rotation cursor for load balancing.
    ///
    /// Updated relaxed on purpose: racing queries at worst start at the
    /// same server.
    lb_start: AtomicUsize,
}

impl Resolver {
    /// Creates a resolver from the system's configured nameservers.
    ///
    /// If discovery comes up empty, the resolver gets a single upstream
    /// at `127.0.0.1:53`.
    pub fn system() -> Self {
        let mut servers = ResolvConf::system().servers;
        if servers.is_empty() {
            servers
                .push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53));
        }
        Self::with_upstreams(
            servers.into_iter().map(upstream_for).collect(),
        )
    }

    /// Creates a resolver for the given server names or addresses.
    ///
    /// Each entry may be an IP address, an address with port, or a host
    /// name which is looked up once at construction time. Every server
    /// gets a fresh transport with default settings, in particular the
    /// short per-attempt timeout of [`single::QUANTUM`].
    pub fn from_servers<S: AsRef<str>>(
        servers: impl IntoIterator<Item = S>,
    ) -> Result<Self, Error> {
        let mut addrs = Vec::new();
        for server in servers {
            addrs.push(server_addr(server.as_ref())?);
        }
        Self::from_addrs(addrs)
    }

    /// Creates a resolver for the given server addresses.
    pub fn from_addrs(
        addrs: impl IntoIterator<Item = SocketAddr>,
    ) -> Result<Self, Error> {
        let upstreams: Vec<_> =
            addrs.into_iter().map(upstream_for).collect();
        if upstreams.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(Self::with_upstreams(upstreams))
    }

    /// Creates a resolver from pre-built upstream transports.
    ///
    /// The transports are adopted as they are; no settings are changed.
    pub fn from_upstreams(
        upstreams: Vec<Arc<dyn Upstream>>,
    ) -> Result<Self, Error> {
        if upstreams.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(Self::with_upstreams(upstreams))
    }

    /// Creates a resolver around a non-empty upstream list.
    fn with_upstreams(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
        Resolver {
            inner: Arc::new(Inner {
                upstreams: RwLock::new(upstreams),
                retries: AtomicUsize::new(DEF_RETRIES),
                load_balance: AtomicBool::new(false),
                lb_start: AtomicUsize::new(0),
            }),
        }
    }
}

/// # Membership
impl Resolver {
    /// Adds an upstream server.
    pub fn add_upstream(&self, upstream: Arc<dyn Upstream>) {
        self.inner.upstreams.write().push(upstream);
    }

    /// Removes an upstream server.
    ///
    /// Membership is pointer identity: the given arc must be the one
    /// handed to [`add_upstream`][Self::add_upstream] or returned by
    /// [`upstream`][Self::upstream].
    pub fn remove_upstream(&self, upstream: &Arc<dyn Upstream>) {
        let mut list = self.inner.upstreams.write();
        if let Some(pos) =
            list.iter().position(|member| Arc::ptr_eq(member, upstream))
        {
            list.remove(pos);
        }
    }

    /// Returns the upstream server at the given position.
    pub fn upstream(&self, index: usize) -> Option<Arc<dyn Upstream>> {
        self.inner.upstreams.read().get(index).cloned()
    }

    /// Returns all current upstream servers.
    pub fn upstreams(&self) -> Vec<Arc<dyn Upstream>> {
        self.inner.upstreams.read().clone()
    }
}

/// # Configuration
impl Resolver {
    /// Sets whether queries rotate their starting server.
    pub fn set_load_balance(&self, enable: bool) {
        self.inner.load_balance.store(enable, Ordering::Relaxed);
    }

    /// Sets the number of attempts per server per query.
    ///
    /// Values below one are raised to one.
    pub fn set_retries(&self, retries: usize) {
        self.inner.retries.store(retries.max(1), Ordering::Relaxed);
    }
}

/// # Sending queries
impl Resolver {
    /// Sends a query and waits for the best available response.
    ///
    /// All servers are queried with a staggered start, each at most
    /// `retries` times. A `NOERROR` response is returned as soon as it
    /// arrives. Failing that, the best non-success response under the
    /// arbitration rules is returned once no server is left to hear
    /// from, and if no response arrived at all, the first error
    /// observed.
    pub async fn send(
        &self,
        query: Message<Vec<u8>>,
    ) -> Result<Message<Bytes>, Error> {
        let servers = self.inner.upstreams.read().clone();
        if servers.is_empty() {
            return Err(Error::NoServers);
        }
        let n = servers.len();
        let retries = self.inner.retries.load(Ordering::Relaxed).max(1);
        let start = if self.inner.load_balance.load(Ordering::Relaxed) {
            self.inner.lb_start.fetch_add(1, Ordering::Relaxed) % n
        } else {
            0
        };

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut attempts = AttemptTable::new();
        let mut state = DispatchState::new(n, retries);
        let mut arbiter = Arbiter::new();

        loop {
            let scan = state.scan(start);
            if let Some(server) = scan.dispatch {
                state.record_dispatch(server);
                dispatch(
                    servers[server].clone(),
                    server,
                    &query,
                    &mut attempts,
                    &reply_tx,
                );
            }
            if !scan.waiting {
                break;
            }

            // With another untried server in line, bound the wait by the
            // stagger interval; otherwise every outstanding attempt is
            // bounded by its own timeout and will deliver eventually.
            let reply = if scan.more_fresh {
                match timeout(STAGGER, reply_rx.recv()).await {
                    Ok(reply) => reply,
                    Err(_) => continue,
                }
            } else {
                reply_rx.recv().await
            };
            let Some(reply) = reply else {
                break;
            };
            let Some(server) = attempts.take(reply.id) else {
                continue;
            };
            state.record_reply(server);

            match reply.outcome {
                Ok(msg) => {
                    if msg.header().rcode() == Rcode::NOERROR {
                        trace!(id = reply.id, server, "received response");
                        return Ok(msg);
                    }
                    trace!(
                        id = reply.id,
                        server,
                        rcode = %msg.header().rcode(),
                        "received non-success response"
                    );
                    state.invalidate(server);
                    arbiter.stash_response(msg);
                }
                Err(err) => {
                    trace!(
                        id = reply.id,
                        server,
                        error = %err,
                        "attempt failed"
                    );
                    if !err.is_transient() {
                        state.invalidate(server);
                    }
                    arbiter.stash_error(err);
                }
            }
        }

        arbiter.finish()
    }

    /// Starts a query without waiting for its outcome.
    ///
    /// The query begins making progress immediately; the returned value
    /// delivers the one outcome via [`GetResponse::get_response`].
    pub fn send_request(&self, query: Message<Vec<u8>>) -> Request {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let _ = tx.send(this.send(query).await);
        });
        Request { rx }
    }
}

/// # Per-server configuration fan-out
///
/// Each setter forwards to every current member. Members added later do
/// not pick up earlier calls; new transports built by this crate start
/// from the defaults of [`single::Config`].
impl Resolver {
    /// Sets the port to send queries to on all servers.
    pub fn set_port(&self, port: u16) {
        for upstream in self.inner.upstreams.read().iter() {
            upstream.set_port(port);
        }
    }

    /// Sets whether queries go over TCP by default on all servers.
    pub fn set_tcp(&self, enable: bool) {
        for upstream in self.inner.upstreams.read().iter() {
            upstream.set_tcp(enable);
        }
    }

    /// Sets whether truncated responses are returned as they are.
    pub fn set_ignore_truncation(&self, enable: bool) {
        for upstream in self.inner.upstreams.read().iter() {
            upstream.set_ignore_truncation(enable);
        }
    }

    /// Sets the EDNS version used on outgoing messages.
    pub fn set_edns(&self, version: Option<u8>) {
        for upstream in self.inner.upstreams.read().iter() {
            upstream.set_edns(version);
        }
    }

    /// Sets the TSIG key that queries will be signed with.
    pub fn set_tsig_key(&self, key: Option<Arc<tsig::Key>>) {
        for upstream in self.inner.upstreams.read().iter() {
            upstream.set_tsig_key(key.clone());
        }
    }

    /// Sets the amount of time to wait for a reply to one attempt.
    pub fn set_timeout(&self, timeout: Duration) {
        for upstream in self.inner.upstreams.read().iter() {
            upstream.set_timeout(timeout);
        }
    }
}

impl Upstream for Resolver {
    fn query(
        &self,
        msg: Message<Vec<u8>>,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_,
        >,
    > {
        Box::pin(self.send(msg))
    }

    fn set_port(&self, port: u16) {
        Resolver::set_port(self, port)
    }

    fn set_tcp(&self, enable: bool) {
        Resolver::set_tcp(self, enable)
    }

    fn set_ignore_truncation(&self, enable: bool) {
        Resolver::set_ignore_truncation(self, enable)
    }

    fn set_edns(&self, version: Option<u8>) {
        Resolver::set_edns(self, version)
    }

    fn set_tsig_key(&self, key: Option<Arc<tsig::Key>>) {
        Resolver::set_tsig_key(self, key)
    }

    fn set_timeout(&self, timeout: Duration) {
        Resolver::set_timeout(self, timeout)
    }
}

//------------ Request --------------------------------------------------------

/// A query started with [`Resolver::send_request`].
pub struct Request {
    /// Delivery channel for the query's one outcome.
    rx: oneshot::Receiver<Result<Message<Bytes>, Error>>,
}

impl Request {
    /// Waits for the outcome of the query.
    async fn get_response_impl(
        &mut self,
    ) -> Result<Message<Bytes>, Error> {
        match (&mut self.rx).await {
            Ok(res) => res,
            Err(_) => Err(Error::NoResponse),
        }
    }
}

impl GetResponse for Request {
    fn get_response(
        &mut self,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_,
        >,
    > {
        Box::pin(self.get_response_impl())
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("multi::Request")
    }
}

//------------ Dispatching ----------------------------------------------------

/// One entry of the reply queue.
struct Reply {
    /// The attempt this outcome belongs to.
    id: u64,

    /// What the attempt produced.
    outcome: Result<Message<Bytes>, Error>,
}

/// Starts one attempt against one server.
fn dispatch(
    server: Arc<dyn Upstream>,
    index: usize,
    query: &Message<Vec<u8>>,
    attempts: &mut AttemptTable,
    reply_tx: &mpsc::UnboundedSender<Reply>,
) {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    // The attempt is registered before its task exists, so the reply
    // cannot beat the registration.
    attempts.insert(id, index);
    trace!(id, server = index, "sending query");
    let query = query.clone();
    let tx = reply_tx.clone();
    tokio::spawn(async move {
        let outcome = server.query(query).await;
        let _ = tx.send(Reply { id, outcome });
    });
}

//------------ AttemptTable ---------------------------------------------------

/// The attempts in flight for one query, by attempt id.
struct AttemptTable {
    /// Maps the attempt id to the index of the queried server.
    table: HashMap<u64, usize>,
}

impl AttemptTable {
    /// Creates an empty table.
    fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Registers an attempt.
    fn insert(&mut self, id: u64, server: usize) {
        self.table.insert(id, server);
    }

    /// Resolves an attempt, removing it from the table.
    fn take(&mut self, id: u64) -> Option<usize> {
        self.table.remove(&id)
    }
}

//------------ DispatchState --------------------------------------------------

/// Per-server dispatch bookkeeping for one query.
struct DispatchState {
    /// Attempts started, per server.
    sent: Vec<usize>,

    /// Outcomes received, per server.
    recvd: Vec<usize>,

    /// Servers no longer considered for dispatch.
    ///
    /// Outstanding replies from an invalidated server are still
    /// integrated.
    invalid: Vec<bool>,

    /// Maximum number of attempts per server.
    retries: usize,
}

/// The outcome of one scan over the server set.
struct Scan {
    /// The server to dispatch to, if any.
    dispatch: Option<usize>,

    /// Whether anything is, or is about to be, in flight.
    ///
    /// A scan with `waiting == false` means there is no server left to
    /// hear from and the query is over.
    waiting: bool,

    /// Whether a further fresh dispatch candidate remains after
    /// `dispatch`.
    more_fresh: bool,
}

impl DispatchState {
    /// Creates state for `n` servers with the given per-server attempt
    /// limit.
    fn new(n: usize, retries: usize) -> Self {
        Self {
            sent: vec![0; n],
            recvd: vec![0; n],
            invalid: vec![false; n],
            retries,
        }
    }

    /// Returns whether a fresh attempt may be dispatched to a server.
    ///
    /// A server is fresh if it has no outstanding attempt, has attempts
    /// left, and has not been invalidated.
    fn is_fresh(&self, server: usize) -> bool {
        self.sent[server] == self.recvd[server]
            && self.sent[server] < self.retries
            && !self.invalid[server]
    }

    /// Scans the server set starting at the given index.
    ///
    /// The first fresh server in scan order becomes the dispatch
    /// candidate. Servers with outstanding attempts keep the query
    /// waiting even when nothing can be dispatched.
    fn scan(&self, start: usize) -> Scan {
        let n = self.sent.len();
        let mut scan = Scan {
            dispatch: None,
            waiting: false,
            more_fresh: false,
        };
        for i in start..start + n {
            let server = i % n;
            if self.is_fresh(server) {
                if scan.dispatch.is_none() {
                    scan.dispatch = Some(server);
                    scan.waiting = true;
                } else {
                    scan.more_fresh = true;
                }
            } else if self.recvd[server] < self.sent[server] {
                scan.waiting = true;
            }
        }
        scan
    }

    /// Records a dispatched attempt.
    fn record_dispatch(&mut self, server: usize) {
        self.sent[server] += 1;
    }

    /// Records a received outcome.
    fn record_reply(&mut self, server: usize) {
        debug_assert!(self.recvd[server] < self.sent[server]);
        self.recvd[server] += 1;
    }

    /// Takes a server out of further dispatching for this query.
    fn invalidate(&mut self, server: usize) {
        self.invalid[server] = true;
    }
}

//------------ Arbiter --------------------------------------------------------

/// Chooses among non-success outcomes.
///
/// `NOERROR` responses never get here; they end the query on the spot.
/// Among the rest, an authoritative `NXDOMAIN` beats any other response
/// code, and any response beats an error. The first error observed is
/// kept as the fallback.
struct Arbiter {
    /// The best non-success response so far.
    best: Option<Message<Bytes>>,

    /// The first error observed.
    first_error: Option<Error>,
}

impl Arbiter {
    /// Creates an arbiter that has seen nothing yet.
    fn new() -> Self {
        Self {
            best: None,
            first_error: None,
        }
    }

    /// Weighs a non-success response against the best one so far.
    fn stash_response(&mut self, msg: Message<Bytes>) {
        match self.best.as_ref() {
            None => self.best = Some(msg),
            Some(best) => {
                if msg.header().rcode() == Rcode::NXDOMAIN
                    && best.header().rcode() != Rcode::NXDOMAIN
                {
                    self.best = Some(msg);
                }
            }
        }
    }

    /// Keeps the first error observed as the fallback outcome.
    fn stash_error(&mut self, err: Error) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    /// Produces the final outcome once no server is left to hear from.
    fn finish(self) -> Result<Message<Bytes>, Error> {
        match self.best {
            Some(best) => Ok(best),
            None => Err(self.first_error.unwrap_or(Error::NoResponse)),
        }
    }
}

//------------ Construction helpers -------------------------------------------

/// Builds the default transport for a server address.
fn upstream_for(addr: SocketAddr) -> Arc<dyn Upstream> {
    let config = single::Config {
        port: addr.port(),
        ..Default::default()
    };
    Arc::new(single::Connection::with_config(addr.ip(), config))
}

/// Turns a server name or address into a socket address.
fn server_addr(server: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(addr, 53));
    }
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    (server, 53)
        .to_socket_addrs()
        .map_err(|err| Error::Lookup(Arc::new(err)))?
        .next()
        .ok_or_else(|| {
            Error::Lookup(Arc::new(io::Error::new(
                io::ErrorKind::NotFound,
                "host name yielded no addresses",
            )))
        })
}

//============ Testing ======================================================
