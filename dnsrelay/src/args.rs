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

//! Command-line flags (spec.md §6).

use structopt::StructOpt;

/// A rule-based DNS forwarder that races upstreams and forwards the
/// earliest-scheduled accepted answer.
#[derive(StructOpt, Debug)]
#[structopt(name = "dnsrelay")]
pub struct Args {
    /// Local UDP bind address.
    #[structopt(short = "b", long = "bind", default_value = "localhost:5353")]
    pub bind: String,

    /// Upstream nameserver (host-only accepted, default port 53; bracketed
    /// IPv6 accepted). Repeatable, comma-separated lists accepted.
    #[structopt(short = "d", long = "upstream", required = true)]
    pub upstreams: Vec<String>,

    /// CIDR-set file path. Each occurrence defines the next 1-based
    /// CIDR-set index, in order given. Repeatable, comma-separated lists
    /// accepted.
    #[structopt(short = "l", long = "cidr-list")]
    pub cidr_lists: Vec<String>,

    /// Configuration file path (INI-style; rule sections are `[rule.*]`).
    #[structopt(short = "c", long = "config")]
    pub config: Option<String>,

    /// Per-query timeout, e.g. `1s`, `500ms` (default 1 second).
    #[structopt(short = "t", long = "timeout", default_value = "1s")]
    pub timeout: String,

    /// Verbose mode: log every query and every decision.
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}
