// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Passive listener set: one bound `TcpListener` per usable interface
//! (§4.3 "Listener set").

use crate::error::{NetError, Result};
use socket2::{Domain, Socket, Type};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lowest port the picker will choose; mirrors §4.3's "≥1024".
const MIN_PORT: u16 = 1024;

/// Derive a starting port from a hash of monotonic time, as the original
/// picks a pseudo-random ephemeral port to reduce collision with other
/// local services on repeated restarts.
pub fn pick_initial_port() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    MIN_PORT + (nanos % (u16::MAX as u64 - MIN_PORT as u64))
        .try_into()
        .unwrap_or(0)
}

/// A set of bound listeners, one per requested interface, all sharing the
/// same port. Binding is all-or-nothing: if any interface fails to bind,
/// every socket opened so far is dropped and the caller should retry with a
/// bumped port after a backoff.
pub struct ListenerSet {
    listeners: Vec<TcpListener>,
    port: u16,
}

impl ListenerSet {
    /// Try to bind `port` on every address in `interfaces`. On the first
    /// failure, all previously bound sockets are dropped (closed) and the
    /// error is returned so the caller can bump `port` and retry.
    pub fn try_bind(interfaces: &[IpAddr], port: u16) -> Result<Self> {
        let mut listeners = Vec::with_capacity(interfaces.len());
        for ip in interfaces {
            let addr = SocketAddr::new(*ip, port);
            let listener = bind_reusable(addr)?;
            listeners.push(listener);
        }
        Ok(ListenerSet { listeners, port })
    }

    /// Bind with retry-and-bump-port-on-failure, per §4.3.
    pub fn bind_with_backoff(
        interfaces: &[IpAddr],
        mut port: u16,
        max_attempts: u32,
    ) -> Result<Self> {
        let mut last_err = None;
        for _ in 0..max_attempts.max(1) {
            match Self::try_bind(interfaces, port) {
                Ok(set) => return Ok(set),
                Err(e) => {
                    log::warn!("bind on port {port} failed: {e}, retrying on a new port");
                    last_err = Some(e);
                    port = port.wrapping_add(1).max(MIN_PORT);
                }
            }
        }
        Err(last_err.unwrap_or(NetError::Timeout))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listeners(&self) -> &[TcpListener] {
        &self.listeners
    }
}

fn bind_reusable(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_loopback() {
        let set = ListenerSet::try_bind(&["127.0.0.1".parse().unwrap()], 0).unwrap();
        assert_eq!(set.listeners().len(), 1);
    }

    #[test]
    fn bind_with_backoff_finds_a_free_port() {
        let first = ListenerSet::try_bind(&["127.0.0.1".parse().unwrap()], 0).unwrap();
        let bound_port = first.listeners()[0].local_addr().unwrap().port();

        let set = ListenerSet::bind_with_backoff(&["127.0.0.1".parse().unwrap()], bound_port, 5);
        // Either it finds a different free port, or fails after retries;
        // either way it must not silently reuse the still-bound one.
        if let Ok(set) = set {
            assert_ne!(set.port(), 0);
        }
    }
}
