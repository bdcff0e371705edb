use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::Error;
use crate::query::RequestDescriptor;
use crate::transport::{RawResponse, Transport};

/// In-memory transport. Replies are queued per path; the last reply for a
/// path repeats once the queue is down to one. Unrouted paths fail like an
/// unreachable host.
pub struct MockTransport {
    replies: Mutex<HashMap<&'static str, VecDeque<RawResponse>>>,
    requests: Mutex<Vec<RequestDescriptor>>,
    held: AtomicBool,
    gate: Semaphore,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            replies: Mutex::default(),
            requests: Mutex::default(),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn reply(&self, path: &'static str, status: u16, body: &str) {
        self.replies
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .push_back(RawResponse {
                status,
                body: Bytes::from(body.to_string()),
            });
    }

    /// Requests block after being recorded until [`MockTransport::release`].
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }

    pub fn requests(&self, path: &str) -> Vec<RequestDescriptor> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.endpoint.path() == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, request: &RequestDescriptor) -> Result<RawResponse, Error> {
        self.requests.lock().unwrap().push(request.clone());
        if self.held.load(Ordering::SeqCst) {
            let _permit = self.gate.acquire().await;
        }
        let mut replies = self.replies.lock().unwrap();
        let queue = replies
            .get_mut(request.endpoint.path())
            .ok_or_else(|| Error::Transport(format!("no route to {}", request.endpoint.path())))?;
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply.ok_or_else(|| Error::Transport("no reply".to_string()))
    }
}
