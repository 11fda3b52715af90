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

//! The decision engine: scans the compiled [`RuleSet`] against one
//! upstream's response and returns a single [`Verdict`].

use crate::rules::{Predicate, RuleSet, Verdict};
use cidrset::CidrSet;
use log::{info, warn};
use std::net::IpAddr;
use trust_dns_proto::op::Message;
use trust_dns_proto::rr::{Record, RecordType};

/// Decide what to do with `response`, a raw wire-format reply received
/// from the upstream at `upstream_index` (1-based). Parse failures and
/// "no rule matched any answer" both produce [`Verdict::Drop`], per spec:
/// rules are an allow-list by construction.
pub fn decide(
    rules: &RuleSet,
    upstream_index: usize,
    response: &[u8],
    cidr_sets: &[CidrSet],
    verbose: bool,
) -> Verdict {
    let msg = match Message::from_vec(response) {
        Ok(m) => m,
        Err(e) => {
            warn!(
                "upstream {}: response failed to parse, dropping: {}",
                upstream_index, e
            );
            return Verdict::Drop;
        }
    };

    for rule in &rules.rules {
        if let Some(want) = rule.predicate.upstream {
            if want != upstream_index {
                continue;
            }
        }
        for answer in msg.answers() {
            if predicate_matches(&rule.predicate, answer, cidr_sets) {
                if verbose {
                    info!(
                        "upstream {}: answer {} {:?} matched rule `{}` -> {:?}",
                        upstream_index,
                        answer.name(),
                        answer.record_type(),
                        rule.name,
                        rule.verdict
                    );
                }
                return rule.verdict;
            }
        }
    }

    if verbose {
        info!(
            "upstream {}: no rule matched any answer, dropping",
            upstream_index
        );
    }
    Verdict::Drop
}

fn predicate_matches(predicate: &Predicate, answer: &Record, cidr_sets: &[CidrSet]) -> bool {
    if let Some(suffix) = &predicate.name_suffix {
        if !name_matches_suffix(&answer.name().to_utf8(), suffix) {
            return false;
        }
    }

    if let Some(rt) = predicate.record_type {
        if answer.record_type() != rt {
            return false;
        }
    }

    if let Some(idx) = predicate.cidr_set {
        match answer_ip(answer) {
            Some(ip) => {
                let set = &cidr_sets[idx - 1];
                if !set.contains(ip) {
                    return false;
                }
            }
            None => return false,
        }
    }

    true
}

fn name_matches_suffix(owner: &str, suffix: &str) -> bool {
    let owner = owner.trim_end_matches('.');
    if owner.len() < suffix.len() {
        return false;
    }
    owner.eq_ignore_ascii_case(suffix) || {
        let tail_len = suffix.len() + 1;
        owner.len() > suffix.len()
            && owner[owner.len() - tail_len..owner.len() - suffix.len()] == *"."
            && owner[owner.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    }
}

fn answer_ip(answer: &Record) -> Option<IpAddr> {
    use trust_dns_proto::rr::RData::{A, AAAA};
    match answer.record_type() {
        RecordType::A | RecordType::AAAA => match answer.rdata() {
            A(v4) => Some(IpAddr::V4(*v4)),
            AAAA(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        },
        _ => None,
    }
}
