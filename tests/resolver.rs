//! Tests for the multi-server engine using scripted upstreams.

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::{Message, MessageBuilder, Name, Rtype};
use multiresolv::{Error, GetResponse, Resolver, Upstream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::{pending, Future};
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

//------------ Test helpers ---------------------------------------------------

fn query() -> Message<Vec<u8>> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_rd(true);
    let mut msg = msg.question();
    msg.push((Name::<Vec<u8>>::from_str("example.com").unwrap(), Rtype::A))
        .unwrap();
    msg.into_message()
}

/// A response with the given rcode, carrying `marker` as its message id
/// so tests can tell which upstream it came from.
fn response(rcode: Rcode, marker: u16) -> Message<Bytes> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_id(marker);
    msg.header_mut().set_qr(true);
    msg.header_mut().set_rcode(rcode);
    Message::from_octets(Bytes::from(msg.finish())).unwrap()
}

fn refused() -> Error {
    Error::Connect(Arc::new(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "refused",
    )))
}

/// One scripted outcome of a [`TestUpstream`] attempt.
#[derive(Clone)]
enum Step {
    Respond(Rcode),
    Fail(Error),
    Hang,
}

/// An upstream producing scripted outcomes after a fixed delay.
///
/// Attempts pop the next step off the script; an exhausted script hangs.
/// Setter calls are recorded for the fan-out tests.
#[derive(Default)]
struct TestUpstream {
    marker: u16,
    delay: Duration,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    last_port: Mutex<Option<u16>>,
    last_tcp: Mutex<Option<bool>>,
    last_timeout: Mutex<Option<Duration>>,
}

impl TestUpstream {
    fn new(marker: u16, delay_ms: u64, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            marker,
            delay: Duration::from_millis(delay_ms),
            steps: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn run(&self) -> Result<Message<Bytes>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front();
        if self.delay > Duration::ZERO {
            sleep(self.delay).await;
        }
        match step {
            Some(Step::Respond(rcode)) => Ok(response(rcode, self.marker)),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) | None => {
                pending::<()>().await;
                unreachable!()
            }
        }
    }
}

impl std::fmt::Debug for TestUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestUpstream")
            .field("marker", &self.marker)
            .finish()
    }
}

impl Upstream for TestUpstream {
    fn query(
        &self,
        _msg: Message<Vec<u8>>,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_,
        >,
    > {
        Box::pin(self.run())
    }

    fn set_port(&self, port: u16) {
        *self.last_port.lock() = Some(port);
    }

    fn set_tcp(&self, enable: bool) {
        *self.last_tcp.lock() = Some(enable);
    }

    fn set_ignore_truncation(&self, _enable: bool) {}

    fn set_edns(&self, _version: Option<u8>) {}

    fn set_tsig_key(&self, _key: Option<Arc<domain::tsig::Key>>) {}

    fn set_timeout(&self, timeout: Duration) {
        *self.last_timeout.lock() = Some(timeout);
    }
}

fn resolver_over(
    upstreams: &[Arc<TestUpstream>],
) -> Resolver {
    let resolver = Resolver::from_upstreams(
        upstreams
            .iter()
            .map(|upstream| upstream.clone() as Arc<dyn Upstream>)
            .collect(),
    )
    .unwrap();
    resolver.set_retries(2);
    resolver
}

//------------ Scenarios ------------------------------------------------------

#[tokio::test]
async fn fast_success_wins() {
    let a = TestUpstream::new(1, 5, vec![Step::Respond(Rcode::NOERROR)]);
    let b = TestUpstream::new(2, 0, vec![Step::Hang]);
    let c = TestUpstream::new(3, 0, vec![Step::Hang]);
    let resolver = resolver_over(&[a.clone(), b, c]);

    let answer = resolver.send(query()).await.unwrap();
    assert_eq!(answer.header().rcode(), Rcode::NOERROR);
    assert_eq!(answer.header().id(), 1);
    assert_eq!(a.calls(), 1);
}

#[tokio::test]
async fn error_then_success() {
    let a = TestUpstream::new(1, 5, vec![Step::Fail(refused())]);
    let b = TestUpstream::new(2, 10, vec![Step::Respond(Rcode::NOERROR)]);
    let c = TestUpstream::new(3, 0, vec![Step::Hang]);
    let resolver = resolver_over(&[a.clone(), b, c]);

    let answer = resolver.send(query()).await.unwrap();
    assert_eq!(answer.header().id(), 2);
    // The hard error took the first server out of the running.
    assert_eq!(a.calls(), 1);
}

#[tokio::test]
async fn noerror_wins_over_stashed_failure() {
    let a = TestUpstream::new(1, 0, vec![Step::Respond(Rcode::SERVFAIL)]);
    let b = TestUpstream::new(2, 10, vec![Step::Respond(Rcode::NOERROR)]);
    let c = TestUpstream::new(3, 0, vec![Step::Hang]);
    let resolver = resolver_over(&[a, b, c]);

    let answer = resolver.send(query()).await.unwrap();
    assert_eq!(answer.header().rcode(), Rcode::NOERROR);
    assert_eq!(answer.header().id(), 2);
}

#[tokio::test]
async fn nxdomain_beats_servfail() {
    let a = TestUpstream::new(1, 0, vec![Step::Respond(Rcode::SERVFAIL)]);
    let b = TestUpstream::new(2, 5, vec![Step::Respond(Rcode::NXDOMAIN)]);
    let c = TestUpstream::new(3, 5, vec![Step::Respond(Rcode::SERVFAIL)]);
    let resolver = resolver_over(&[a, b, c]);

    let answer = resolver.send(query()).await.unwrap();
    assert_eq!(answer.header().rcode(), Rcode::NXDOMAIN);
    assert_eq!(answer.header().id(), 2);
}

#[tokio::test]
async fn first_hard_error_is_surfaced() {
    let a = TestUpstream::new(1, 0, vec![Step::Fail(Error::ShortSend)]);
    let b = TestUpstream::new(2, 15, vec![Step::Fail(Error::Parse)]);
    let c = TestUpstream::new(3, 15, vec![Step::Fail(Error::Parse)]);
    let resolver = resolver_over(&[a.clone(), b.clone(), c.clone()]);

    let err = resolver.send(query()).await.unwrap_err();
    assert!(matches!(err, Error::ShortSend));
    // Hard errors invalidate: one attempt per server.
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(c.calls(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let a = TestUpstream::new(
        1,
        0,
        vec![Step::Fail(Error::Timeout), Step::Fail(Error::Timeout)],
    );
    let b = TestUpstream::new(2, 10, vec![Step::Respond(Rcode::NOERROR)]);
    let c = TestUpstream::new(3, 0, vec![Step::Hang]);
    let resolver = resolver_over(&[a.clone(), b, c]);

    let answer = resolver.send(query()).await.unwrap();
    assert_eq!(answer.header().id(), 2);
    // The expired attempts left the server eligible up to the retry
    // limit.
    assert_eq!(a.calls(), 2);
}

#[tokio::test]
async fn attempts_are_bounded_by_retries() {
    let a = TestUpstream::new(
        1,
        0,
        vec![Step::Fail(Error::Timeout), Step::Fail(Error::Timeout)],
    );
    let b = TestUpstream::new(
        2,
        0,
        vec![Step::Fail(Error::Timeout), Step::Fail(Error::Timeout)],
    );
    let c = TestUpstream::new(
        3,
        0,
        vec![Step::Fail(Error::Timeout), Step::Fail(Error::Timeout)],
    );
    let resolver = resolver_over(&[a.clone(), b.clone(), c.clone()]);

    let err = resolver.send(query()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 2);
    assert_eq!(c.calls(), 2);
}

#[tokio::test]
async fn load_balance_rotates_start() {
    let a = TestUpstream::new(0, 0, vec![Step::Respond(Rcode::NOERROR); 3]);
    let b = TestUpstream::new(1, 0, vec![Step::Respond(Rcode::NOERROR); 3]);
    let c = TestUpstream::new(2, 0, vec![Step::Respond(Rcode::NOERROR); 3]);
    let resolver = resolver_over(&[a, b, c]);
    resolver.set_load_balance(true);

    for call in 0..3u16 {
        let answer = resolver.send(query()).await.unwrap();
        assert_eq!(answer.header().id(), call);
    }
}

#[tokio::test]
async fn send_request_delivers_once() {
    let a = TestUpstream::new(7, 5, vec![Step::Respond(Rcode::NOERROR)]);
    let resolver = resolver_over(&[a]);

    let mut request = resolver.send_request(query());
    let answer = request.get_response().await.unwrap();
    assert_eq!(answer.header().id(), 7);
}

#[tokio::test]
async fn setters_fan_out_to_all_members() {
    let a = TestUpstream::new(1, 0, vec![]);
    let b = TestUpstream::new(2, 0, vec![]);
    let c = TestUpstream::new(3, 0, vec![]);
    let resolver = resolver_over(&[a.clone(), b.clone(), c.clone()]);

    resolver.set_port(5353);
    resolver.set_tcp(true);
    resolver.set_timeout(Duration::from_secs(2));

    for upstream in [&a, &b, &c] {
        assert_eq!(*upstream.last_port.lock(), Some(5353));
        assert_eq!(*upstream.last_tcp.lock(), Some(true));
        assert_eq!(
            *upstream.last_timeout.lock(),
            Some(Duration::from_secs(2))
        );
    }
}

#[tokio::test]
async fn membership_is_pointer_identity() {
    let a = TestUpstream::new(1, 0, vec![Step::Respond(Rcode::NOERROR)]);
    let b = TestUpstream::new(2, 0, vec![Step::Respond(Rcode::NOERROR)]);
    let resolver = resolver_over(&[a.clone(), b.clone()]);

    let first = resolver.upstream(0).unwrap();
    assert!(Arc::ptr_eq(&first, &(a.clone() as Arc<dyn Upstream>)));
    assert_eq!(resolver.upstreams().len(), 2);

    resolver.remove_upstream(&first);
    assert_eq!(resolver.upstreams().len(), 1);

    let second = resolver.upstream(0).unwrap();
    resolver.remove_upstream(&second);
    assert!(resolver.upstream(0).is_none());

    // An emptied resolver has no one to ask.
    assert!(matches!(
        resolver.send(query()).await,
        Err(Error::NoServers)
    ));

    resolver.add_upstream(b as Arc<dyn Upstream>);
    let answer = resolver.send(query()).await.unwrap();
    assert_eq!(answer.header().id(), 2);
}

#[tokio::test]
async fn empty_construction_is_rejected() {
    assert!(matches!(
        Resolver::from_upstreams(Vec::new()),
        Err(Error::NoServers)
    ));
}
