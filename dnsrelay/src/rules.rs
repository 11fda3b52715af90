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

//! Rule compilation: turns the `[rule.*]` sections of a parsed INI document
//! into an ordered [`RuleSet`].

use ini::Ini;
use log::warn;
use std::time::Duration;
use trust_dns_proto::rr::RecordType;

/// What to do with a response that matched a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Discard the response; the client gets nothing from this upstream.
    Drop,
    /// Forward the response as soon as possible (zero delay).
    Accept,
    /// Forward the response, but not before `Duration` has elapsed.
    Delay(Duration),
}

/// A rule's match conditions. A field set to `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    /// 1-based upstream index, or `None` to match any upstream.
    pub upstream: Option<usize>,
    /// 1-based CIDR-set index, or `None` to skip CIDR matching.
    pub cidr_set: Option<usize>,
    /// Exact record type, or `None` to match any type.
    pub record_type: Option<RecordType>,
    /// Domain suffix (trimmed of whitespace/dots), or `None` to match any name.
    pub name_suffix: Option<String>,
}

/// A single compiled rule: declaration order is significant, first match wins.
#[derive(Debug, Clone)]
pub struct Rule {
    /// The section name suffix after `rule.`, kept only for log messages.
    pub name: String,
    /// The rule's match predicate.
    pub predicate: Predicate,
    /// The verdict to return when this rule matches.
    pub verdict: Verdict,
}

/// The compiled, ordered rule table.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Rules in declaration order.
    pub rules: Vec<Rule>,
}

/// Map a rule `type` value to a [`RecordType`]. Unknown strings return
/// `None`, which the caller treats as a soft error (ignore, warn).
fn parse_record_type(s: &str) -> Option<RecordType> {
    match s.to_ascii_uppercase().as_str() {
        "A" => Some(RecordType::A),
        "AAAA" => Some(RecordType::AAAA),
        "CNAME" => Some(RecordType::CNAME),
        "MX" => Some(RecordType::MX),
        "NS" => Some(RecordType::NS),
        "PTR" => Some(RecordType::PTR),
        "SOA" => Some(RecordType::SOA),
        "SRV" => Some(RecordType::SRV),
        "TXT" => Some(RecordType::TXT),
        "CAA" => Some(RecordType::CAA),
        "NAPTR" => Some(RecordType::NAPTR),
        "TLSA" => Some(RecordType::TLSA),
        "DNSKEY" => Some(RecordType::DNSKEY),
        "DS" => Some(RecordType::DS),
        "NSEC" => Some(RecordType::NSEC),
        "NSEC3" => Some(RecordType::NSEC3),
        "RRSIG" => Some(RecordType::RRSIG),
        "SIG" => Some(RecordType::SIG),
        "HINFO" => Some(RecordType::HINFO),
        "AXFR" => Some(RecordType::AXFR),
        "IXFR" => Some(RecordType::IXFR),
        "OPT" => Some(RecordType::OPT),
        "ALL" | "ANY" => Some(RecordType::ANY),
        _ => None,
    }
}

fn normalize_name_suffix(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('.').to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Compile every `[rule.<name>]` section of `conf` into an ordered
/// [`RuleSet`], in the document's declaration order.
///
/// - `upstream_count` / `cidr_set_count` bound the valid 1-based `server`
///   and `ipset` indices; out-of-range values degrade to "match any" with a
///   warning, per spec.
/// - A missing or unparsable `delay` on a `DELAY` target degrades to
///   `ACCEPT`, with a warning.
/// - An unrecognised `target` is fatal.
pub fn compile(
    conf: &Ini,
    upstream_count: usize,
    cidr_set_count: usize,
) -> Result<RuleSet, crate::error::StartupError> {
    let mut rules = Vec::new();

    for section in conf.sections().flatten() {
        let name = match section.strip_prefix("rule.") {
            Some(n) => n.to_string(),
            None => continue,
        };
        let props = conf
            .section(Some(section))
            .expect("section name came from conf.sections()");

        let target = props
            .get("target")
            .ok_or_else(|| crate::error::StartupError::MissingTarget(name.clone()))?;

        let verdict = match target.to_ascii_uppercase().as_str() {
            "DROP" => Verdict::Drop,
            "ACCEPT" => Verdict::Accept,
            "DELAY" => match props.get("delay").and_then(parse_duration) {
                Some(d) => Verdict::Delay(d),
                None => {
                    warn!(
                        "rule `{}`: target=DELAY but `delay` is missing or unparsable, degrading to ACCEPT",
                        name
                    );
                    Verdict::Accept
                }
            },
            other => {
                return Err(crate::error::StartupError::UnknownTarget {
                    section: name,
                    value: other.to_string(),
                })
            }
        };

        let upstream = match props.get("server") {
            None => None,
            Some(raw) => match raw.parse::<usize>() {
                Ok(idx) if idx >= 1 && idx <= upstream_count => Some(idx),
                _ => {
                    warn!(
                        "rule `{}`: server={:?} is out of range, ignoring (matches any upstream)",
                        name, raw
                    );
                    None
                }
            },
        };

        let cidr_set = match props.get("ipset") {
            None => None,
            Some(raw) => match raw.parse::<usize>() {
                Ok(idx) if idx >= 1 && idx <= cidr_set_count => Some(idx),
                _ => {
                    warn!(
                        "rule `{}`: ipset={:?} is out of range, ignoring",
                        name, raw
                    );
                    None
                }
            },
        };

        let record_type = match props.get("type") {
            None => None,
            Some(raw) => match parse_record_type(raw) {
                Some(rt) => Some(rt),
                None => {
                    warn!("rule `{}`: type={:?} is unknown, ignoring", name, raw);
                    None
                }
            },
        };

        let name_suffix = match props.get("name") {
            None => None,
            Some(raw) => match normalize_name_suffix(raw) {
                Some(n) => Some(n),
                None => {
                    warn!("rule `{}`: name={:?} is empty after trim, ignoring", name, raw);
                    None
                }
            },
        };

        rules.push(Rule {
            name,
            predicate: Predicate {
                upstream,
                cidr_set,
                record_type,
                name_suffix,
            },
            verdict,
        });
    }

    Ok(RuleSet { rules })
}

/// Parse a duration value. Accepts a bare integer (seconds) or a suffixed
/// value (`ms`, `s`, `m`, `h`), matching the informal "duration" values
/// spec.md's CLI `-t` flag and rule `delay` key both use.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(v) = raw.strip_suffix("ms") {
        return v.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(v) = raw.strip_suffix('s') {
        return v.trim().parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    if let Some(v) = raw.strip_suffix('m') {
        return v
            .trim()
            .parse::<f64>()
            .ok()
            .map(|m| Duration::from_secs_f64(m * 60.0));
    }
    if let Some(v) = raw.strip_suffix('h') {
        return v
            .trim()
            .parse::<f64>()
            .ok()
            .map(|h| Duration::from_secs_f64(h * 3600.0));
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Ini {
        Ini::load_from_str(text).unwrap()
    }

    #[test]
    fn basic_drop_accept_order_is_preserved() {
        let conf = load(
            "[rule.block-ads]\ntarget=DROP\nname=ads.example.com\n\n[rule.default]\ntarget=ACCEPT\n",
        );
        let set = compile(&conf, 1, 1).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].name, "block-ads");
        assert_eq!(set.rules[0].verdict, Verdict::Drop);
        assert_eq!(set.rules[1].verdict, Verdict::Accept);
    }

    #[test]
    fn unknown_target_is_fatal() {
        let conf = load("[rule.bad]\ntarget=MAYBE\n");
        let err = compile(&conf, 1, 1).unwrap_err();
        assert!(matches!(
            err,
            crate::error::StartupError::UnknownTarget { .. }
        ));
    }

    #[test]
    fn missing_target_is_fatal() {
        let conf = load("[rule.bad]\nname=foo.com\n");
        let err = compile(&conf, 1, 1).unwrap_err();
        assert!(matches!(
            err,
            crate::error::StartupError::MissingTarget(_)
        ));
    }

    #[test]
    fn delay_missing_degrades_to_accept() {
        let conf = load("[rule.r]\ntarget=DELAY\n");
        let set = compile(&conf, 1, 1).unwrap();
        assert_eq!(set.rules[0].verdict, Verdict::Accept);
    }

    #[test]
    fn out_of_range_server_degrades_to_wildcard() {
        let conf = load("[rule.r]\ntarget=ACCEPT\nserver=5\n");
        let set = compile(&conf, 1, 1).unwrap();
        assert_eq!(set.rules[0].predicate.upstream, None);
    }

    #[test]
    fn unknown_type_degrades_to_wildcard() {
        let conf = load("[rule.r]\ntarget=ACCEPT\ntype=NOTAREALTYPE\n");
        let set = compile(&conf, 1, 1).unwrap();
        assert_eq!(set.rules[0].predicate.record_type, None);
    }

    #[test]
    fn name_is_trimmed_of_whitespace_and_dots() {
        let conf = load("[rule.r]\ntarget=ACCEPT\nname= .ads.example.com. \n");
        let set = compile(&conf, 1, 1).unwrap();
        assert_eq!(
            set.rules[0].predicate.name_suffix,
            Some("ads.example.com".to_string())
        );
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("garbage"), None);
    }
}
