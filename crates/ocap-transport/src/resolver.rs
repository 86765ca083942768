use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::TransportError;

struct ResolverState {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>,
    terminated: Option<TransportError>,
}

/// Correlates asynchronous request/response pairs across a transport.
///
/// `create_message` allocates a monotonically increasing correlation id,
/// hands it to the caller's send function, and returns a future that settles
/// when `handle_response` is later called with the same id.
pub struct MessageResolver {
    state: Mutex<ResolverState>,
}

impl Default for MessageResolver {
    fn default() -> Self {
        MessageResolver {
            state: Mutex::new(ResolverState {
                next_id: 0,
                pending: HashMap::new(),
                terminated: None,
            }),
        }
    }
}

impl MessageResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_message(
        &self,
        send: impl FnOnce(u64),
    ) -> BoxFuture<'static, Result<Value, TransportError>> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = &state.terminated {
                // Terminated resolvers reject new requests up front rather
                // than letting them wait for a reply that cannot come.
                let _ = tx.send(Err(err.clone()));
                None
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.pending.insert(id, tx);
                Some(id)
            }
        };
        if let Some(id) = id {
            send(id);
        }
        Box::pin(async move {
            match rx.await {
                Ok(outcome) => outcome,
                // Resolver dropped with this request still outstanding.
                Err(_) => Err(TransportError::Closed),
            }
        })
    }

    /// Settle the request with this correlation id. Responses for unknown
    /// ids are logged, not raised: they are late replies after a
    /// termination, not kernel bugs.
    pub fn handle_response(&self, id: u64, value: Value) {
        let tx = self.state.lock().unwrap().pending.remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(value));
            }
            None => tracing::warn!(id, "response for unknown correlation id"),
        }
    }

    /// Reject every outstanding correlation atomically and refuse new ones.
    /// Used when the underlying transport dies.
    pub fn terminate_all(&self, error: TransportError) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.terminated = Some(error.clone());
            std::mem::take(&mut state.pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}
