//! Bounded history of forwarded requests for manual replay.

use std::collections::VecDeque;

use crate::protocol::{ForwardedRequest, RequestId};

const CAPACITY: usize = 10;

/// FIFO of the most recent relay-delivered requests. Entries are never
/// mutated once recorded; the oldest is evicted past capacity.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    entries: VecDeque<ForwardedRequest>,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(CAPACITY),
        }
    }

    pub fn record(&mut self, request: ForwardedRequest) {
        self.entries.push_back(request);
        if self.entries.len() > CAPACITY {
            self.entries.pop_front();
        }
    }

    /// Most recently recorded request, if any.
    pub fn latest(&self) -> Option<&ForwardedRequest> {
        self.entries.back()
    }

    /// Copy of `request` with a freshly minted id, ready to re-issue
    /// against the local service.
    pub fn replayable(request: &ForwardedRequest) -> ForwardedRequest {
        ForwardedRequest {
            request_id: RequestId::generate(),
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
