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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::backoff::{
    Backoff, BackoffConfig, BackoffConfigError, DEFAULT_EXPONENTIAL_CONFIG, ExponentialBackoff,
    FixedBackoff,
};

/// Named args carrying this prefix never affect subchannel identity, even
/// when present in [`ChannelArgs::extra`].
pub const NO_SUBCHANNEL_ARG_PREFIX: &str = "no-subchannel.";

/// Channel configuration consumed by the connection-management core.
///
/// A subset of these options participates in subchannel identity (see
/// [`ChannelArgs::key_args`]); the rest configure behavior on top of an
/// existing subchannel and are stripped from the pool key so that channels
/// differing only in those options still share connections.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ChannelArgs {
    /// Initial reconnect backoff delay.  Floored at 100ms.
    pub initial_reconnect_backoff: Option<Duration>,
    /// Upper bound on the reconnect backoff delay.  Floored at 100ms.
    pub max_reconnect_backoff: Option<Duration>,
    /// Minimum time a single connection attempt is given to complete.
    /// Floored at 100ms.
    pub min_connect_timeout: Option<Duration>,
    /// Testing hook: pins the reconnect backoff to a fixed delay with no
    /// jitter or growth, overriding the exponential options.
    pub fixed_reconnect_backoff: Option<Duration>,
    /// Keepalive interval for the transport.  Upper-bounded per subchannel
    /// by `throttle_keepalive_time`.
    pub keepalive_time: Option<Duration>,
    /// Enables per-subchannel health checking against the named service.
    pub health_check_service_name: Option<String>,
    /// Disables health checking even when a service name is configured.
    pub inhibit_health_checking: bool,
    /// The authority to present to backends unless overridden per address.
    pub default_authority: Option<String>,
    /// Proxy the transport should connect through.
    pub proxy: Option<String>,
    /// Arbitrary named args.  Keys carrying [`NO_SUBCHANNEL_ARG_PREFIX`] are
    /// excluded from subchannel identity.
    pub extra: BTreeMap<String, String>,
}

impl ChannelArgs {
    /// The health check service name to use, accounting for inhibition.
    pub fn health_check_service_name(&self) -> Option<&str> {
        if self.inhibit_health_checking {
            return None;
        }
        self.health_check_service_name.as_deref()
    }

    /// Builds the reconnect backoff schedule these args describe.
    pub fn backoff(&self) -> Result<Arc<dyn Backoff>, BackoffConfigError> {
        let min_connect_timeout = self
            .min_connect_timeout
            .unwrap_or(DEFAULT_EXPONENTIAL_CONFIG.min_connect_timeout);
        if let Some(delay) = self.fixed_reconnect_backoff {
            return Ok(Arc::new(FixedBackoff::new(delay, min_connect_timeout)));
        }
        let config = BackoffConfig {
            base_delay: self
                .initial_reconnect_backoff
                .unwrap_or(DEFAULT_EXPONENTIAL_CONFIG.base_delay),
            max_delay: self
                .max_reconnect_backoff
                .unwrap_or(DEFAULT_EXPONENTIAL_CONFIG.max_delay),
            min_connect_timeout,
            ..DEFAULT_EXPONENTIAL_CONFIG
        };
        Ok(Arc::new(ExponentialBackoff::new(config)?))
    }

    /// Extracts the subset of args relevant to subchannel identity.
    ///
    /// Health-checking options never participate: a channel with health
    /// checking enabled shares subchannels with one without.  `extra` keys
    /// carrying [`NO_SUBCHANNEL_ARG_PREFIX`] are likewise stripped.
    pub fn key_args(&self) -> KeyArgs {
        KeyArgs {
            keepalive_time: self.keepalive_time,
            default_authority: self.default_authority.clone(),
            proxy: self.proxy.clone(),
            extra: self
                .extra
                .iter()
                .filter(|(k, _)| !k.starts_with(NO_SUBCHANNEL_ARG_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// The uniqueness-relevant subset of [`ChannelArgs`], used in
/// [`crate::client::subchannel::SubchannelKey`].
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyArgs {
    pub(crate) keepalive_time: Option<Duration>,
    pub(crate) default_authority: Option<String>,
    pub(crate) proxy: Option<String>,
    pub(crate) extra: BTreeMap<String, String>,
}
