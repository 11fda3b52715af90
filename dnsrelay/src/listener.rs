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

//! The client-facing listener: binds one UDP socket and spawns one
//! [`session`] task per incoming query.

use crate::session::{handle_query, SessionContext};
use log::warn;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Serve queries forever. Each datagram received on `ctx.client_socket`
/// spawns an independent session; a malformed or oversized datagram from a
/// client is logged and otherwise ignored, never aborts the listener.
pub async fn serve(ctx: Arc<SessionContext>) -> ! {
    let socket: Arc<UdpSocket> = Arc::clone(&ctx.client_socket);
    let mut buf = [0u8; 1500];

    loop {
        let (n, client_addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("listener: recv_from failed: {}", e);
                continue;
            }
        };

        let query = buf[..n].to_vec();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_query(ctx, query, client_addr).await;
        });
    }
}
