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

mod arbiter;
mod args;
mod decision;
mod error;
mod listener;
mod rules;
mod session;
mod upstream;

use anyhow::{Context, Result};
use args::Args;
use cidrset::CidrSet;
use error::StartupError;
use ini::Ini;
use log::{info, LevelFilter};
use rules::RuleSet;
use session::SessionContext;
use simple_logger::SimpleLogger;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::UdpSocket;

async fn load_cidr_sets(paths: &[String]) -> Result<Vec<CidrSet>, StartupError> {
    let mut sets = Vec::with_capacity(paths.len());
    for path in paths {
        for entry in path.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            sets.push(CidrSet::load_file(entry).await?);
        }
    }
    Ok(sets)
}

fn load_rules(config: &Option<String>, upstream_count: usize, cidr_count: usize) -> Result<RuleSet> {
    match config {
        None => Ok(RuleSet::default()),
        Some(path) => {
            let conf = Ini::load_from_file(path)
                .with_context(|| format!("failed to load configuration file {:?}", path))?;
            Ok(rules::compile(&conf, upstream_count, cidr_count)?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();

    let level = if args.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    SimpleLogger::new().with_level(level).init()?;

    let upstreams = upstream::parse_upstreams(&args.upstreams)?;
    let cidr_sets = load_cidr_sets(&args.cidr_lists).await?;
    let rule_set = load_rules(&args.config, upstreams.len(), cidr_sets.len())?;
    let session_timeout = rules::parse_duration(&args.timeout).unwrap_or(Duration::from_secs(1));

    let socket = UdpSocket::bind(args.bind.as_str())
        .await
        .map_err(|source| StartupError::Bind {
            addr: args.bind.clone(),
            source,
        })?;
    info!("dnsrelay listening on {}", args.bind);
    info!(
        "{} upstream(s), {} cidr set(s), {} rule(s)",
        upstreams.len(),
        cidr_sets.len(),
        rule_set.rules.len()
    );

    let ctx = Arc::new(SessionContext {
        client_socket: Arc::new(socket),
        upstreams,
        rules: Arc::new(rule_set),
        cidr_sets: Arc::new(cidr_sets),
        session_timeout,
        verbose: args.verbose,
    });

    listener::serve(ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Predicate, Rule, Verdict};
    use crate::session::handle_query;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use trust_dns_proto::op::{Message, Query};
    use trust_dns_proto::rr::{Name, RData, Record, RecordType};

    async fn mock_upstream(reply: Vec<u8>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    fn query_bytes() -> Vec<u8> {
        let mut m = Message::new();
        m.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        m.to_vec().unwrap()
    }

    fn reply_bytes(ip: &str) -> Vec<u8> {
        let mut m = Message::new();
        m.add_answer(Record::from_rdata(
            Name::from_ascii("example.com.").unwrap(),
            60,
            RData::A(ip.parse().unwrap()),
        ));
        m.to_vec().unwrap()
    }

    async fn run_query(ctx: Arc<SessionContext>, query: Vec<u8>, client_addr: SocketAddr) {
        handle_query(ctx, query, client_addr).await;
    }

    #[tokio::test]
    async fn single_upstream_accept_forwards_reply() {
        let upstream_reply = reply_bytes("203.0.113.5");
        let upstream = mock_upstream(upstream_reply.clone()).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();
        let listener_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let ctx = Arc::new(SessionContext {
            client_socket: listener_socket,
            upstreams: vec![upstream],
            rules: Arc::new(RuleSet {
                rules: vec![Rule {
                    name: "default".into(),
                    predicate: Predicate::default(),
                    verdict: Verdict::Accept,
                }],
            }),
            cidr_sets: Arc::new(vec![]),
            session_timeout: Duration::from_millis(500),
            verbose: false,
        });

        tokio::spawn(run_query(ctx, query_bytes(), client_addr));

        let mut buf = [0u8; 512];
        let (n, _) =
            tokio::time::timeout(Duration::from_millis(200), client_socket.recv_from(&mut buf))
                .await
                .expect("client should receive a reply")
                .unwrap();
        assert_eq!(&buf[..n], upstream_reply.as_slice());
    }

    #[tokio::test]
    async fn dropped_by_cidr_rule_yields_no_reply() {
        let upstream_reply = reply_bytes("10.1.2.3");
        let upstream = mock_upstream(upstream_reply).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();
        let listener_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let blocklist = cidrset::CidrSet::from_lines("10.0.0.0/8\n").unwrap();
        let ctx = Arc::new(SessionContext {
            client_socket: listener_socket,
            upstreams: vec![upstream],
            rules: Arc::new(RuleSet {
                rules: vec![
                    Rule {
                        name: "block".into(),
                        predicate: Predicate {
                            cidr_set: Some(1),
                            ..Default::default()
                        },
                        verdict: Verdict::Drop,
                    },
                    Rule {
                        name: "default".into(),
                        predicate: Predicate::default(),
                        verdict: Verdict::Accept,
                    },
                ],
            }),
            cidr_sets: Arc::new(vec![blocklist]),
            session_timeout: Duration::from_millis(150),
            verbose: false,
        });

        tokio::spawn(run_query(ctx, query_bytes(), client_addr));

        let mut buf = [0u8; 512];
        let result =
            tokio::time::timeout(Duration::from_millis(250), client_socket.recv_from(&mut buf))
                .await;
        assert!(result.is_err(), "client should receive nothing");
    }

    #[tokio::test]
    async fn shorter_delay_preempts_longer_one() {
        let slow_reply = reply_bytes("198.51.100.1");
        let fast_reply = reply_bytes("198.51.100.2");
        let upstream_slow = mock_upstream(slow_reply).await;
        let upstream_fast = mock_upstream(fast_reply.clone()).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();
        let listener_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let ctx = Arc::new(SessionContext {
            client_socket: listener_socket,
            upstreams: vec![upstream_slow, upstream_fast],
            rules: Arc::new(RuleSet {
                rules: vec![
                    Rule {
                        name: "slow".into(),
                        predicate: Predicate {
                            upstream: Some(1),
                            ..Default::default()
                        },
                        verdict: Verdict::Delay(Duration::from_millis(100)),
                    },
                    Rule {
                        name: "fast".into(),
                        predicate: Predicate {
                            upstream: Some(2),
                            ..Default::default()
                        },
                        verdict: Verdict::Delay(Duration::from_millis(10)),
                    },
                ],
            }),
            cidr_sets: Arc::new(vec![]),
            session_timeout: Duration::from_millis(500),
            verbose: false,
        });

        tokio::spawn(run_query(ctx, query_bytes(), client_addr));

        let mut buf = [0u8; 512];
        let (n, _) =
            tokio::time::timeout(Duration::from_millis(300), client_socket.recv_from(&mut buf))
                .await
                .expect("client should receive a reply")
                .unwrap();
        assert_eq!(&buf[..n], fast_reply.as_slice());
    }
}
