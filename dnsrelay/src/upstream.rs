// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Parsing of `-d` upstream specs into resolved [`SocketAddr`]s.
//!
//! Accepted forms: a bare IPv4/IPv6 host (port defaults to 53), `host:port`
//! for IPv4, and bracketed `[host]` / `[host]:port` / `[host%zone]:port` for
//! IPv6, where `zone` is either an interface name or a numeric interface
//! index (numeric indices are normalised to the name via `if_indextoname`
//! and rejected if they don't name a live interface).

use crate::error::StartupError;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};

fn invalid(spec: &str, reason: impl Into<String>) -> StartupError {
    StartupError::InvalidUpstream {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

/// Resolve a numeric or named IPv6 zone to a scope id, validating that it
/// names an interface that currently exists.
fn zone_to_scope_id(zone: &str) -> Result<u32, StartupError> {
    if let Ok(idx) = zone.parse::<u32>() {
        let mut name_buf = [0u8; libc::IF_NAMESIZE];
        let ptr =
            unsafe { libc::if_indextoname(idx, name_buf.as_mut_ptr() as *mut libc::c_char) };
        if ptr.is_null() {
            return Err(StartupError::InvalidZone(zone.to_string()));
        }
        Ok(idx)
    } else {
        let cstr = std::ffi::CString::new(zone)
            .map_err(|_| StartupError::InvalidZone(zone.to_string()))?;
        let idx = unsafe { libc::if_nametoindex(cstr.as_ptr()) };
        if idx == 0 {
            return Err(StartupError::InvalidZone(zone.to_string()));
        }
        Ok(idx)
    }
}

fn parse_bracketed_v6(spec: &str) -> Result<SocketAddr, StartupError> {
    let close = spec
        .find(']')
        .ok_or_else(|| invalid(spec, "missing closing ']'"))?;
    let inner = &spec[1..close];
    let rest = &spec[close + 1..];

    let (addr_part, zone) = match inner.split_once('%') {
        Some((a, z)) => (a, Some(z)),
        None => (inner, None),
    };
    let ip: Ipv6Addr = addr_part
        .parse()
        .map_err(|_| invalid(spec, "not a valid IPv6 address"))?;
    let port: u16 = if let Some(p) = rest.strip_prefix(':') {
        p.parse().map_err(|_| invalid(spec, "not a valid port"))?
    } else {
        53
    };
    let scope_id = match zone {
        Some(z) => zone_to_scope_id(z)?,
        None => 0,
    };
    Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope_id)))
}

/// Parse a single upstream spec (one element; splitting comma-separated
/// lists is the caller's job, matching the `-d` flag's "repeatable,
/// comma-separated accepted" contract).
pub fn parse_one(spec: &str) -> Result<SocketAddr, StartupError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(invalid(spec, "empty upstream spec"));
    }
    if spec.starts_with('[') {
        return parse_bracketed_v6(spec);
    }
    // Unbracketed: either a bare address (IPv4 or IPv6, default port 53) or
    // IPv4 `host:port`. A single colon with a numeric tail is the port
    // separator; anything else (multiple colons) is a bare IPv6 literal.
    if let Some((host, port)) = spec.rsplit_once(':') {
        if spec.matches(':').count() == 1 {
            let ip: IpAddr = host
                .parse()
                .map_err(|_| invalid(spec, "not a valid IPv4 address"))?;
            let port: u16 = port
                .parse()
                .map_err(|_| invalid(spec, "not a valid port"))?;
            return Ok(SocketAddr::new(ip, port));
        }
    }
    let ip: IpAddr = spec
        .parse()
        .map_err(|_| invalid(spec, "not a valid IP address"))?;
    Ok(SocketAddr::new(ip, 53))
}

/// Parse all `-d` occurrences (each possibly a comma-separated list) into
/// the ordered, 1-based-indexed upstream list. Rejects duplicates.
pub fn parse_upstreams(specs: &[String]) -> Result<Vec<SocketAddr>, StartupError> {
    let mut upstreams = Vec::new();
    for group in specs {
        for entry in group.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let addr = parse_one(entry)?;
            if upstreams.contains(&addr) {
                return Err(StartupError::DuplicateUpstream(addr.to_string()));
            }
            upstreams.push(addr);
        }
    }
    Ok(upstreams)
}
