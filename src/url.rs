// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Parses the four transport URL schemes accepted at the Connection/Server
// boundary (spec §6). Any other scheme is `IncError::InvalidArgs`.

use crate::error::IncError;

/// A parsed transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUrl {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Unix { path: String },
    Pipe { path: String },
}

impl TransportUrl {
    pub fn parse(s: &str) -> Result<Self, IncError> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| IncError::InvalidArgs(format!("missing scheme in {s:?}")))?;

        match scheme {
            "tcp" => {
                let (host, port) = parse_host_port(rest)?;
                Ok(TransportUrl::Tcp { host, port })
            }
            "udp" => {
                let (host, port) = parse_host_port(rest)?;
                Ok(TransportUrl::Udp { host, port })
            }
            "unix" => {
                let path = parse_abs_path(rest)?;
                Ok(TransportUrl::Unix { path })
            }
            "pipe" => {
                let path = parse_abs_path(rest)?;
                Ok(TransportUrl::Pipe { path })
            }
            other => Err(IncError::InvalidArgs(format!("unsupported scheme {other:?}"))),
        }
    }
}

fn parse_host_port(rest: &str) -> Result<(String, u16), IncError> {
    let (host, port_str) = rest
        .rsplit_once(':')
        .ok_or_else(|| IncError::InvalidArgs(format!("missing port in {rest:?}")))?;
    if host.is_empty() {
        return Err(IncError::InvalidArgs("empty host".into()));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| IncError::InvalidArgs(format!("invalid port {port_str:?}")))?;
    Ok((host.to_string(), port))
}

fn parse_abs_path(rest: &str) -> Result<String, IncError> {
    if !rest.starts_with('/') {
        return Err(IncError::InvalidArgs(format!("path must be absolute: {rest:?}")));
    }
    Ok(rest.to_string())
}
