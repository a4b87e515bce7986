/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The data model produced by name resolution and consumed by the
//! load-balancing policies.  Resolver drivers themselves (DNS and friends)
//! live outside this crate; they feed policies by constructing
//! [`ResolverUpdate`] values.

use core::fmt;
use std::fmt::{Display, Formatter};
use std::hash::Hash;

use crate::attributes::Attributes;

/// An Address is an identifier that indicates how to connect to one backend.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub struct Address {
    /// Identifies the kind of transport used to connect to this address.
    /// Typically [`TCP_NETWORK_TYPE`].
    pub network_type: &'static str,
    /// The address itself, passed verbatim to the connector.
    pub address: String,
    /// Optional per-address data, e.g. an [`AddressWeight`].  Immutable once
    /// the resolver has emitted the address.
    pub attributes: Attributes,
}

/// Indicates an IPv4 or IPv6 address to be connected to via TCP/IP.
pub static TCP_NETWORK_TYPE: &str = "tcp";

impl Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Attributes intentionally do not participate; equal addresses hash
        // equally since Eq implies equal (network_type, address).
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Per-address weight used by weighted policies such as `ring_hash`.
/// Addresses without this attribute default to a weight of 1; a weight of
/// zero excludes the address from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressWeight(pub u32);

/// The authority to present when connecting to a balancer address, when it
/// differs from the channel default.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressAuthority(pub String);

/// The current state of the name resolver, delivered to a load-balancing
/// policy via `LbPolicy::resolver_update`.
#[derive(Debug, Clone)]
pub struct ResolverUpdate {
    /// The resolved addresses, or the error the resolver ran into.  A policy
    /// that already holds a working address list ignores the error and
    /// retains its list.
    pub addresses: Result<Vec<Address>, String>,
    /// Human-readable context for this resolution, folded into the status of
    /// pickers produced from an unusable update.
    pub resolution_note: String,
    /// Optional data which may be used by the LB policy.
    pub attributes: Attributes,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        Self {
            addresses: Ok(Vec::new()),
            resolution_note: String::new(),
            attributes: Attributes::new(),
        }
    }
}
