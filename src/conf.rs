//! Discovering the system's resolver configuration.
//!
//! This module provides the subset of the resolver configuration the
//! multi-server resolver actually needs: the list of nameservers the
//! system is configured with. On Unix systems the list comes from
//! `/etc/resolv.conf`; everywhere else discovery yields an empty list
//! and the caller falls back to a default server.

use std::fs;
use std::io::{self, BufRead, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// The default port for DNS.
const DNS_PORT: u16 = 53;

//------------ ResolvConf ----------------------------------------------------

/// The relevant parts of the system resolver configuration.
#[derive(Clone, Debug, Default)]
pub struct ResolvConf {
    /// Addresses of the configured nameservers.
    pub servers: Vec<SocketAddr>,
}

impl ResolvConf {
    /// Creates a configuration from the system's configuration file.
    ///
    /// Returns an empty configuration if the file is missing, unreadable,
    /// or the platform has no such file.
    pub fn system() -> Self {
        if cfg!(unix) {
            Self::parse_file("/etc/resolv.conf").unwrap_or_default()
        } else {
            Self::default()
        }
    }

    /// Parses the configuration from a file.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        Self::parse(fs::File::open(path)?)
    }

    /// Parses the configuration from a reader.
    ///
    /// The format is that of the `/etc/resolv.conf` file: one directive
    /// per line, comments starting with `#` or `;`. Only `nameserver`
    /// directives are interpreted; everything else is skipped.
    pub fn parse<R: Read>(reader: R) -> Result<Self, io::Error> {
        let mut res = Self::default();
        for line in io::BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty()
                || line.starts_with(';')
                || line.starts_with('#')
            {
                continue;
            }
            let mut words = line.split_whitespace();
            if words.next() != Some("nameserver") {
                continue;
            }
            let Some(addr) = words.next() else { continue };
            // A plain address or, on resolvers that support it, an
            // address with a port.
            if let Ok(mut addrs) = (addr, DNS_PORT).to_socket_addrs() {
                res.servers.extend(addrs.next());
            } else if let Ok(addr) = addr.parse::<SocketAddr>() {
                res.servers.push(addr);
            }
        }
        Ok(res)
    }
}

//============ Testing ======================================================
