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

//! The narrow interface through which subchannels obtain connected
//! transports.  The transport itself (framing, flow control, TLS) lives
//! outside this crate.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tonic::async_trait;

use crate::service::Service;

/// A completed connection: a call destination plus a oneshot that resolves
/// when the connection terminates, carrying the reason.  The subchannel that
/// created the transport owns it exclusively and drops it on disconnect.
pub struct ConnectedTransport {
    pub service: Box<dyn Service>,
    pub disconnection_listener: oneshot::Receiver<Result<(), String>>,
}

/// Per-attempt options derived from channel args and subchannel state.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ConnectOptions {
    /// Keepalive interval, already upper-bounded by any throttles applied to
    /// the subchannel.
    pub keepalive_time: Option<Duration>,
    /// The authority to present to the backend.
    pub authority: Option<String>,
    /// The attempt gives up at this time.  The subchannel also enforces this
    /// deadline itself; connectors may use it to bound internal work.
    pub deadline: Option<Instant>,
}

/// Produces connected transports from addresses.  The error string returned
/// from a failed attempt is the one the subchannel surfaces to its watchers
/// in TransientFailure.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: String,
        opts: ConnectOptions,
    ) -> Result<ConnectedTransport, String>;
}

/// A registry of connectors keyed by address network type.
pub struct ConnectorRegistry {
    connectors: Mutex<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_connector(&self, network_type: &str, connector: impl Connector + 'static) {
        self.connectors
            .lock()
            .unwrap()
            .insert(network_type.to_string(), Arc::new(connector));
    }

    pub fn get_connector(&self, network_type: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.lock().unwrap().get(network_type).cloned()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry consulted when a subchannel is created without an explicit
/// connector.
pub static GLOBAL_CONNECTOR_REGISTRY: LazyLock<ConnectorRegistry> =
    LazyLock::new(ConnectorRegistry::new);
