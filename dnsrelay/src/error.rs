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

//! Error taxonomy for the forwarder's startup path.
//!
//! Runtime transient errors (upstream send failures, malformed responses,
//! outbound read errors, timeouts) are not represented as types here: per
//! spec they are logged once, scoped to the one session that hit them, and
//! never propagated. Only errors that should abort the whole process at
//! startup get a variant.

use thiserror::Error;

/// Fatal startup errors. `main` turns these into a process exit code.
#[derive(Error, Debug)]
pub enum StartupError {
    /// A `-d` upstream spec didn't resolve to a usable socket address.
    #[error("invalid upstream {spec:?}: {reason}")]
    InvalidUpstream {
        /// The raw command-line value.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The same upstream endpoint was given more than once.
    #[error("duplicate upstream: {0}")]
    DuplicateUpstream(String),

    /// A `%zone` suffix on an IPv6 upstream didn't name a real interface.
    #[error("invalid IPv6 zone {0:?}")]
    InvalidZone(String),

    /// A CIDR set file failed to load or parse.
    #[error(transparent)]
    Cidr(#[from] cidrset::CidrError),

    /// A `[rule.*]` section had no `target` key.
    #[error("rule `{0}` is missing mandatory key `target`")]
    MissingTarget(String),

    /// A `[rule.*]` section's `target` value wasn't recognised.
    #[error("rule `{section}` has unknown target {value:?}")]
    UnknownTarget {
        /// The rule section's name.
        section: String,
        /// The unrecognised `target` value.
        value: String,
    },

    /// The local bind address could not be parsed or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
