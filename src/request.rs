//! Contracts between the resolver and its upstream servers.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::message::CopyRecordsError;
use domain::base::message_builder::PushError;
use domain::base::Message;
use domain::tsig::{self, ValidationError};
use std::boxed::Box;
use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;
use std::{error, fmt};

//------------ Upstream ------------------------------------------------------

/// A single upstream server that can answer one DNS query at a time.
///
/// An upstream owns one server endpoint together with its transport
/// configuration. Every call to [`query`][Self::query] performs exactly one
/// attempt and resolves to exactly one outcome; retrying is the business of
/// whoever drives the upstream.
///
/// The setters mirror the configuration surface that
/// [`Resolver`][crate::multi::Resolver] fans out to all of its members.
/// They take `&self` since upstreams are shared between concurrent calls;
/// a changed setting applies to attempts started after the call.
pub trait Upstream: Debug + Send + Sync {
    /// Sends one query to this server and waits for its reply.
    fn query(
        &self,
        msg: Message<Vec<u8>>,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_,
        >,
    >;

    /// Sets the port to send queries to.
    fn set_port(&self, port: u16);

    /// Sets whether queries go over TCP by default.
    fn set_tcp(&self, enable: bool);

    /// Sets whether truncated responses are returned as they are.
    ///
    /// When disabled, a truncated response triggers a retry over TCP.
    fn set_ignore_truncation(&self, enable: bool);

    /// Sets the EDNS version used on outgoing messages.
    ///
    /// `None` sends messages without an OPT record. Only version 0 is
    /// currently meaningful.
    fn set_edns(&self, version: Option<u8>);

    /// Sets the TSIG key that queries will be signed with.
    fn set_tsig_key(&self, key: Option<Arc<tsig::Key>>);

    /// Sets the amount of time to wait for a reply before giving up.
    fn set_timeout(&self, timeout: Duration);
}

//------------ GetResponse ---------------------------------------------------

/// Trait for getting the result of a query started earlier.
///
/// A value implementing this trait is handed out by
/// [`Resolver::send_request`][crate::multi::Resolver::send_request]. The
/// query makes progress without the caller polling; `get_response` merely
/// picks up the one outcome the query produces.
pub trait GetResponse: Debug {
    /// Returns the result of the query.
    fn get_response(
        &mut self,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_,
        >,
    >;
}

//------------ Error ---------------------------------------------------------

/// Errors produced when querying upstream servers.
#[derive(Clone, Debug)]
pub enum Error {
    /// The resolver has no upstream servers to query.
    NoServers,

    /// No response became available.
    NoResponse,

    /// The attempt did not finish within the configured timeout.
    ///
    /// This is the one transient error kind: the server stays eligible
    /// for further attempts.
    Timeout,

    /// Looking up a server name failed.
    Lookup(Arc<io::Error>),

    /// Setting up the socket or connection failed.
    Connect(Arc<io::Error>),

    /// Sending the query failed.
    Send(Arc<io::Error>),

    /// The query was only partially sent.
    ShortSend,

    /// Receiving the reply failed.
    Receive(Arc<io::Error>),

    /// The message is too long for the transport.
    LongMessage,

    /// The reply could not be parsed as a DNS message.
    Parse,

    /// Composing the query message failed.
    Push,

    /// The reply received does not belong to the query sent.
    WrongReply,

    /// Signing the query failed.
    TsigSign,

    /// The reply failed TSIG verification.
    TsigVerify(Arc<ValidationError>),
}

impl Error {
    /// Returns whether the error leaves the server eligible for retries.
    ///
    /// Only an expired attempt is transient; every other failure is taken
    /// as evidence that the server cannot currently produce an answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<PushError> for Error {
    fn from(_: PushError) -> Self {
        Self::Push
    }
}

impl From<CopyRecordsError> for Error {
    fn from(err: CopyRecordsError) -> Self {
        match err {
            CopyRecordsError::Parse(_) => Self::Parse,
            CopyRecordsError::Push(_) => Self::Push,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoServers => write!(f, "no upstream servers"),
            Error::NoResponse => write!(f, "no response available"),
            Error::Timeout => write!(f, "timeout waiting for reply"),
            Error::Lookup(_) => write!(f, "server name lookup failed"),
            Error::Connect(_) => write!(f, "connecting to server failed"),
            Error::Send(_) => write!(f, "sending query failed"),
            Error::ShortSend => write!(f, "query only partially sent"),
            Error::Receive(_) => write!(f, "receiving reply failed"),
            Error::LongMessage => {
                write!(f, "message too long for transport")
            }
            Error::Parse => write!(f, "reply is not a valid DNS message"),
            Error::Push => write!(f, "composing query message failed"),
            Error::WrongReply => {
                write!(f, "reply does not belong to the query")
            }
            Error::TsigSign => write!(f, "signing the query failed"),
            Error::TsigVerify(err) => {
                write!(f, "TSIG verification failed: {}", err)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::NoServers => None,
            Error::NoResponse => None,
            Error::Timeout => None,
            Error::Lookup(err) => Some(err.as_ref()),
            Error::Connect(err) => Some(err.as_ref()),
            Error::Send(err) => Some(err.as_ref()),
            Error::ShortSend => None,
            Error::Receive(err) => Some(err.as_ref()),
            Error::LongMessage => None,
            Error::Parse => None,
            Error::Push => None,
            Error::WrongReply => None,
            Error::TsigSign => None,
            Error::TsigVerify(err) => Some(err.as_ref()),
        }
    }
}
