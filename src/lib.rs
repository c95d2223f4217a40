//! A multi-server DNS stub resolver.
//!
//! This crate provides a resolver that dispatches each query to a set of
//! equivalent upstream servers in parallel, retries individual servers on
//! loss, and arbitrates among the responses that come back. Any single
//! server may be slow, unreachable, or answer with a transient failure;
//! by fanning out with bounded retries and a staggered start, latency
//! tracks the fastest good responder while correctness survives the
//! failure of individual servers.
//!
//! The crate consists of the following modules:
//!
//! * [`multi`] contains [`Resolver`], the engine that owns the upstream
//!   set and runs the dispatch and arbitration loop,
//! * [`single`] contains a per-server transport speaking DNS over UDP
//!   with TCP fallback,
//! * [`request`] contains the [`Upstream`] contract connecting the two
//!   as well as the crate's [`Error`] type,
//! * [`conf`] discovers the system's configured nameservers.
//!
//! The quickest way to a working resolver is [`Resolver::system`], which
//! picks up the system configuration:
//!
//! ```no_run
//! # async fn example() -> Result<(), multiresolv::Error> {
//! use domain::base::{MessageBuilder, Name, Rtype};
//!
//! let resolver = multiresolv::Resolver::system();
//! let mut msg = MessageBuilder::new_vec();
//! msg.header_mut().set_rd(true);
//! let mut msg = msg.question();
//! msg.push((Name::<Vec<u8>>::root(), Rtype::SOA)).unwrap();
//! let answer = resolver.send(msg.into_message()).await?;
//! # let _ = answer; Ok(())
//! # }
//! ```

pub mod conf;
pub mod multi;
pub mod request;
pub mod single;

pub use self::multi::Resolver;
pub use self::request::{Error, GetResponse, Upstream};
