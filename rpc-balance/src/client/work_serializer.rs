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

use std::collections::VecDeque;
use std::sync::Mutex;

type Job = Box<dyn FnOnce() + Send>;

/// A cooperative single-writer queue for control-plane closures.
///
/// Closures run in FIFO order with at most one runner at a time.  Scheduling
/// never runs anything; [`WorkSerializer::drain_queue`] runs queued closures
/// to completion on the calling thread, and a drain that finds another drain
/// already in progress returns immediately (that runner will pick up the new
/// work).  A closure may schedule further closures on the same serializer;
/// they run after it completes, within the same drain, without recursion.
///
/// Closures must not be run while holding any data-plane lock; the intended
/// usage is to collect work under a lock, release it, then drain.
#[derive(Default)]
pub struct WorkSerializer {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Job>,
    draining: bool,
}

impl WorkSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a closure.  The closure runs during some subsequent (or
    /// in-progress) drain, never inline.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        self.state.lock().unwrap().queue.push_back(Box::new(job));
    }

    /// Runs queued closures until the queue is empty.  Idempotent: if a
    /// drain is already in progress on any thread, returns immediately.
    pub fn drain_queue(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            job();
        }
    }

    /// Enqueues a closure and drains.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        self.schedule(job);
        self.drain_queue();
    }
}
