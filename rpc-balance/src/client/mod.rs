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

use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;

pub mod args;
pub mod backoff;
pub mod connectivity;
pub mod health;
pub mod load_balancing;
pub mod name_resolution;
pub mod subchannel;
pub mod transport;
pub mod work_serializer;

/// The connectivity state of a subchannel (an individual connection to one
/// backend), also used for the aggregate state a load-balancing policy
/// reports for its whole subchannel set.
///
/// Subchannels begin in Idle.  A connection request moves them to
/// Connecting, which resolves to Ready on success or TransientFailure on
/// error.  A Ready subchannel that loses its connection returns to Idle; a
/// TransientFailure subchannel returns to Idle once its backoff period
/// expires.  Shutdown is terminal: no further transitions are observed after
/// it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A connectivity state paired with the error that produced it, delivered to
/// state watchers and load-balancing policies.
#[derive(Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.
    pub connectivity_state: ConnectivityState,
    /// Describes the most recent connection error.  Set when the state is
    /// TransientFailure, and on the Idle transition that follows the loss of
    /// a previously Ready transport.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl SubchannelState {
    pub(crate) fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    pub(crate) fn with_error(connectivity_state: ConnectivityState, error: String) -> Self {
        Self {
            connectivity_state,
            last_connection_error: Some(Arc::from(Box::from(error) as Box<dyn Error + Send + Sync>)),
        }
    }
}

impl Default for SubchannelState {
    fn default() -> Self {
        Self::new(ConnectivityState::Idle)
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({})", self.connectivity_state, err),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

impl std::fmt::Debug for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}
