//! Outstanding request bookkeeping.
//!
//! Every tracked request holds a one-shot callback that fires exactly once:
//! with the reply, with `LinkTimeout` when its deadline passes, or with
//! `LinkGone` when the link drops. Whatever comes second is discarded.
//!
//! Deadlines are kept in an ordered set beside the token map so the owning
//! task can sleep until the earliest one and sweep in O(expired).

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};

/// Reply continuation for a tracked request
pub type ReplyCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

struct TrackedRequest {
    channel: u8,
    deadline: Instant,
    callback: ReplyCallback,
}

pub struct RequestTracker {
    pending: HashMap<u32, TrackedRequest>,
    deadlines: BTreeSet<(Instant, u32)>,
    next_token: u32,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    /// Token sequence starts at a random point so tokens from an earlier link
    /// are unlikely to match requests on a new one.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            next_token: seed,
        }
    }

    /// Fresh correlation token; never 0 and never one still outstanding.
    pub fn next_token(&mut self) -> u32 {
        loop {
            self.next_token = self.next_token.wrapping_add(1);
            let token = self.next_token;
            if token != 0 && !self.pending.contains_key(&token) {
                return token;
            }
        }
    }

    pub fn register(&mut self, token: u32, channel: u8, timeout: Duration, callback: ReplyCallback) {
        let deadline = Instant::now() + timeout;
        if let Some(old) = self.pending.insert(
            token,
            TrackedRequest {
                channel,
                deadline,
                callback,
            },
        ) {
            // replaced entry never fires; drop its deadline too
            self.deadlines.remove(&(old.deadline, token));
        }
        self.deadlines.insert((deadline, token));
        trace!(token, channel, ?timeout, "Request tracked");
    }

    fn remove(&mut self, token: u32) -> Option<TrackedRequest> {
        let request = self.pending.remove(&token)?;
        self.deadlines.remove(&(request.deadline, token));
        Some(request)
    }

    /// Deliver an outcome for `token`, answered on `channel`.
    ///
    /// Returns false when nothing is pending under that token on that
    /// channel, e.g. a reply that arrived after its timeout. A reply on the
    /// wrong channel leaves the request pending.
    pub fn resolve(&mut self, token: u32, channel: u8, outcome: Result<Bytes>) -> bool {
        match self.pending.get(&token) {
            Some(request) if request.channel == channel => {}
            Some(request) => {
                debug!(
                    token,
                    expected = request.channel,
                    channel,
                    "Reply on the wrong channel"
                );
                return false;
            }
            None => return false,
        }
        match self.remove(token) {
            Some(request) => {
                trace!(token, channel, "Request resolved");
                (request.callback)(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every request whose deadline is at or before `now`.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        while let Some((deadline, token)) = self.deadlines.first().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, token));
            if let Some(request) = self.pending.remove(&token) {
                expired.push((token, request));
            }
        }

        let count = expired.len();
        for (token, request) in expired {
            debug!(token, channel = request.channel, "Request timed out");
            (request.callback)(Err(ProtocolError::LinkTimeout));
        }
        count
    }

    /// Fail everything with `LinkGone`.
    pub fn fail_all(&mut self) -> usize {
        self.deadlines.clear();
        let drained: Vec<_> = self.pending.drain().collect();
        let count = drained.len();
        for (_, request) in drained {
            (request.callback)(Err(ProtocolError::LinkGone));
        }
        count
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(deadline, _)| deadline)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
