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

//! One session per incoming client query: fan the query out to every
//! upstream, race their answers through the [`Arbiter`], and forward at
//! most one reply back to the client.

use crate::arbiter::Arbiter;
use crate::decision::decide;
use crate::rules::RuleSet;
use cidrset::CidrSet;
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Everything a session needs that's shared across every in-flight query,
/// handed down from `main`.
pub struct SessionContext {
    /// The socket the client's query arrived on; replies go back out on it.
    pub client_socket: Arc<UdpSocket>,
    /// Upstreams in declaration order; index 0 is rule-file upstream `1`.
    pub upstreams: Vec<SocketAddr>,
    /// Compiled rules.
    pub rules: Arc<RuleSet>,
    /// Loaded CIDR sets, in declaration order.
    pub cidr_sets: Arc<Vec<CidrSet>>,
    /// Upper bound on how long a session waits for upstream answers before
    /// giving up on an unanswered query entirely.
    pub session_timeout: Duration,
    /// Whether to log every rule match, not just warnings.
    pub verbose: bool,
}

async fn bind_ephemeral(family_of: IpAddr) -> std::io::Result<UdpSocket> {
    match family_of {
        IpAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").await,
        IpAddr::V6(_) => UdpSocket::bind("[::]:0").await,
    }
}

/// Handle one client query end to end. Errors are logged and scoped to this
/// session only; they never propagate to the listener.
pub async fn handle_query(ctx: Arc<SessionContext>, query: Vec<u8>, client_addr: SocketAddr) {
    let needs_v4 = ctx.upstreams.iter().any(|a| a.is_ipv4());
    let needs_v6 = ctx.upstreams.iter().any(|a| a.is_ipv6());

    let v4_socket = if needs_v4 {
        match bind_ephemeral(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("session: failed to bind IPv4 outbound socket: {}", e);
                None
            }
        }
    } else {
        None
    };
    let v6_socket = if needs_v6 {
        match bind_ephemeral(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("session: failed to bind IPv6 outbound socket: {}", e);
                None
            }
        }
    } else {
        None
    };

    if v4_socket.is_none() && v6_socket.is_none() {
        warn!("session: no outbound socket available, dropping query from {}", client_addr);
        return;
    }

    if ctx.verbose {
        info!(
            "query from {}: {} bytes, fanning out to {} upstream(s)",
            client_addr,
            query.len(),
            ctx.upstreams.len()
        );
    }

    let send_time = tokio::time::Instant::now();

    for upstream in &ctx.upstreams {
        let socket = match upstream {
            SocketAddr::V4(_) => v4_socket.as_ref(),
            SocketAddr::V6(_) => v6_socket.as_ref(),
        };
        if let Some(socket) = socket {
            if let Err(e) = socket.send_to(&query, *upstream).await {
                warn!("session: failed to send query to {}: {}", upstream, e);
            }
        }
    }

    let arbiter = Arbiter::new();
    let done = Arc::new(Notify::new());
    let mut buf4 = [0u8; 4096];
    let mut buf6 = [0u8; 4096];

    let deadline = send_time + ctx.session_timeout;

    loop {
        if arbiter.has_fired() {
            break;
        }

        let (n, from) = tokio::select! {
            _ = done.notified() => break,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("session: query from {} timed out waiting for upstreams", client_addr);
                break;
            }
            r = recv_or_pending(v4_socket.as_ref(), &mut buf4) => match r {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("session: outbound read error: {}", e);
                    continue;
                }
            },
            r = recv_or_pending(v6_socket.as_ref(), &mut buf6) => match r {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("session: outbound read error: {}", e);
                    continue;
                }
            },
        };

        let upstream_index = match ctx.upstreams.iter().position(|u| *u == from) {
            Some(idx) => idx + 1,
            None => continue,
        };
        let payload = if from.is_ipv4() { &buf4[..n] } else { &buf6[..n] };
        let verdict = decide(&ctx.rules, upstream_index, payload, &ctx.cidr_sets, ctx.verbose);
        let delay = match verdict {
            crate::rules::Verdict::Drop => continue,
            crate::rules::Verdict::Accept => Duration::ZERO,
            crate::rules::Verdict::Delay(d) => d,
        };

        let reply = payload.to_vec();
        let client_socket = Arc::clone(&ctx.client_socket);
        let done = Arc::clone(&done);
        arbiter
            .submit(delay, move || async move {
                if let Err(e) = client_socket.send_to(&reply, client_addr).await {
                    warn!("session: failed to reply to {}: {}", client_addr, e);
                }
                done.notify_one();
            })
            .await;
    }
}

async fn recv_or_pending(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
