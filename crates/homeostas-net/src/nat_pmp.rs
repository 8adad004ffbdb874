// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NAT-PMP client state machine (`nat_pmp`, C9, §4.3 and §6).
//!
//! Wire formats are byte-exact and in network byte order, unlike every other
//! on-wire/on-disk integer in this workspace.

use crate::error::{NetError, Result};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

pub const NAT_PMP_PORT: u16 = 5351;
const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 9;

/// Default requested mapping lifetime, renewed at `lifetime / 2` (§4.3).
pub const DEFAULT_LIFETIME_SECS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    UnsupportedVersion,
    NotAuthorized,
    NetworkFailure,
    OutOfResources,
    UnsupportedOpcode,
    Unknown(u16),
}

impl From<u16> for ResultCode {
    fn from(v: u16) -> Self {
        match v {
            0 => ResultCode::Success,
            1 => ResultCode::UnsupportedVersion,
            2 => ResultCode::NotAuthorized,
            3 => ResultCode::NetworkFailure,
            4 => ResultCode::OutOfResources,
            5 => ResultCode::UnsupportedOpcode,
            other => ResultCode::Unknown(other),
        }
    }
}

/// The address and mapped port a successful handshake exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub public_addr: Ipv4Addr,
    pub mapped_public_port: u16,
    pub lifetime_secs: u32,
}

fn encode_public_address_request() -> [u8; 2] {
    [0, 0]
}

fn decode_public_address_response(buf: &[u8]) -> Result<(ResultCode, Ipv4Addr)> {
    if buf.len() < 12 {
        return Err(NetError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short PublicAddressResponse",
        )));
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]).into();
    let addr = Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]);
    Ok((result, addr))
}

fn encode_port_mapping_request(private_port: u16, public_port: u16, lifetime: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = 0; // version
    buf[1] = 2; // op=2: map TCP
    buf[2..4].copy_from_slice(&0u16.to_be_bytes()); // reserved
    buf[4..6].copy_from_slice(&private_port.to_be_bytes());
    buf[6..8].copy_from_slice(&public_port.to_be_bytes());
    buf[8..12].copy_from_slice(&lifetime.to_be_bytes());
    buf
}

fn decode_port_mapping_response(buf: &[u8]) -> Result<(ResultCode, u16, u16, u32)> {
    if buf.len() < 16 {
        return Err(NetError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short NewPortMappingResponse",
        )));
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]).into();
    let private_port = u16::from_be_bytes([buf[8], buf[9]]);
    let mapped_public_port = u16::from_be_bytes([buf[10], buf[11]]);
    let lifetime = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    Ok((result, private_port, mapped_public_port, lifetime))
}

/// One NAT-PMP client bound to a discovered gateway.
pub struct NatPmpClient {
    socket: UdpSocket,
    gateway: SocketAddr,
}

impl NatPmpClient {
    pub fn new(gateway: Ipv4Addr) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(NatPmpClient {
            socket,
            gateway: SocketAddr::new(gateway.into(), NAT_PMP_PORT),
        })
    }

    /// `locate_gateway → PublicAddressRequest → NewPortMappingRequest`
    /// (§4.3 state machine). Retries each request with doubling backoff
    /// from `INITIAL_TIMEOUT` up to `MAX_TIMEOUT`.
    pub fn map_port(&self, private_port: u16, lifetime_secs: u32) -> Result<Mapping> {
        let reply = self.request_with_retry(&encode_public_address_request())?;
        let (result, public_addr) = decode_public_address_response(&reply)?;
        if result != ResultCode::Success {
            return Err(NetError::NatPmp(result));
        }

        let request = encode_port_mapping_request(private_port, private_port, lifetime_secs);
        let reply = self.request_with_retry(&request)?;
        let (result, _private, mapped_public_port, granted_lifetime) =
            decode_port_mapping_response(&reply)?;
        if result != ResultCode::Success {
            return Err(NetError::NatPmp(result));
        }

        Ok(Mapping {
            public_addr,
            mapped_public_port,
            lifetime_secs: granted_lifetime,
        })
    }

    fn request_with_retry(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut timeout = INITIAL_TIMEOUT;
        let mut last_err = None;
        for _ in 0..MAX_RETRIES {
            self.socket.send_to(request, self.gateway)?;
            self.socket.set_read_timeout(Some(timeout))?;

            let mut buf = [0u8; 32];
            match self.socket.recv_from(&mut buf) {
                Ok((n, _from)) => return Ok(buf[..n].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    last_err = Some(NetError::Timeout);
                    timeout = (timeout * 2).min(MAX_TIMEOUT);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or(NetError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_address_response_roundtrip() {
        let mut buf = [0u8; 12];
        buf[0] = 0;
        buf[1] = 128;
        buf[2..4].copy_from_slice(&0u16.to_be_bytes());
        buf[4..8].copy_from_slice(&3600u32.to_be_bytes());
        buf[8..12].copy_from_slice(&[203, 0, 113, 9]);

        let (result, addr) = decode_public_address_response(&buf).unwrap();
        assert_eq!(result, ResultCode::Success);
        assert_eq!(addr, Ipv4Addr::new(203, 0, 113, 9));
    }

    #[test]
    fn port_mapping_request_layout() {
        let buf = encode_port_mapping_request(4242, 4242, 60);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 2);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 4242);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 4242);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 60);
    }

    #[test]
    fn result_code_from_wire_values() {
        assert_eq!(ResultCode::from(0), ResultCode::Success);
        assert_eq!(ResultCode::from(4), ResultCode::OutOfResources);
        assert_eq!(ResultCode::from(99), ResultCode::Unknown(99));
    }
}
