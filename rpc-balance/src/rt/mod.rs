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

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod tokio;

/// An abstraction over an asynchronous runtime.
///
/// Provides the two capabilities the connection-management core needs from
/// its environment: spawning background tasks and timed sleeps.  Implemented
/// for tokio by [`tokio::TokioRuntime`]; tests may substitute their own.
pub trait Runtime: Send + Sync {
    /// Spawns the given task to run in the background, returning a handle
    /// that aborts it when invoked (or dropped by the holder's choosing).
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
    -> Box<dyn TaskHandle>;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Future<Output = ()> {}

/// Handle to a spawned task.
pub trait TaskHandle: Send + Sync {
    /// Aborts the associated task.
    fn abort(&self);
}

/// Returns the default, tokio-backed runtime.
pub fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(tokio::TokioRuntime {})
}
