use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::duplex::{DuplexEnd, DuplexWriter};
use crate::error::TransportError;

/// Labeled frame carried over the shared underlying channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub label: String,
    pub content: Value,
}

type UnknownHandler = Box<dyn Fn(Envelope) + Send + Sync>;

struct Registry {
    channels: HashMap<String, mpsc::UnboundedSender<Value>>,
    on_unknown: Option<UnknownHandler>,
}

/// Splits one duplex channel into independently drained labeled sub-channels.
///
/// Incoming envelopes are routed by label; envelopes for unregistered labels
/// go to the unknown-label handler rather than being dropped silently. When
/// the underlying channel ends or fails, every sub-channel ends.
pub struct Multiplexer {
    writer: DuplexWriter<Envelope>,
    registry: Arc<Mutex<Registry>>,
    drive: JoinHandle<()>,
}

impl Multiplexer {
    pub fn new(underlying: DuplexEnd<Envelope>) -> Self {
        let (writer, mut reader) = underlying.split();
        let registry = Arc::new(Mutex::new(Registry {
            channels: HashMap::new(),
            on_unknown: None,
        }));
        let routed = registry.clone();
        let drive = tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(envelope)) => route(&routed, envelope),
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "multiplexer underlying channel failed");
                        routed.lock().unwrap().channels.clear();
                        break;
                    }
                    None => {
                        routed.lock().unwrap().channels.clear();
                        break;
                    }
                }
            }
        });
        Multiplexer {
            writer,
            registry,
            drive,
        }
    }

    /// Install the handler for envelopes whose label has no sub-channel.
    pub fn set_unknown_handler(&self, handler: impl Fn(Envelope) + Send + Sync + 'static) {
        self.registry.lock().unwrap().on_unknown = Some(Box::new(handler));
    }

    /// Open the sub-channel for `label`. Each label may be opened once.
    pub fn channel(&self, label: impl Into<String>) -> Result<MuxChannel, TransportError> {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().unwrap();
        if registry.channels.contains_key(&label) {
            return Err(TransportError::DuplicateLabel(label));
        }
        registry.channels.insert(label.clone(), tx);
        Ok(MuxChannel {
            label,
            writer: self.writer.clone(),
            rx,
        })
    }

    /// Drop a label's sub-channel; its reader observes end of stream.
    pub fn close_channel(&self, label: &str) {
        self.registry.lock().unwrap().channels.remove(label);
    }

    /// End the underlying channel; the remote side sees a clean end.
    pub fn close(&self) {
        self.writer.end();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.drive.abort();
    }
}

fn route(registry: &Arc<Mutex<Registry>>, envelope: Envelope) {
    let mut guard = registry.lock().unwrap();
    if let Some(tx) = guard.channels.get(&envelope.label) {
        match tx.send(envelope.content.clone()) {
            Ok(()) => return,
            Err(_) => {
                // Receiver went away; further traffic for this label is unknown.
                guard.channels.remove(&envelope.label);
            }
        }
    }
    match &guard.on_unknown {
        Some(handler) => handler(envelope),
        None => tracing::warn!(label = %envelope.label, "envelope for unknown label dropped"),
    }
}

/// One labeled sub-channel of a multiplexer.
pub struct MuxChannel {
    label: String,
    writer: DuplexWriter<Envelope>,
    rx: mpsc::UnboundedReceiver<Value>,
}

/// Cloneable write handle for one labeled sub-channel.
#[derive(Clone)]
pub struct MuxSender {
    label: String,
    writer: DuplexWriter<Envelope>,
}

impl MuxSender {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn write(&self, content: Value) -> Result<(), TransportError> {
        self.writer.write(Envelope {
            label: self.label.clone(),
            content,
        })
    }
}

impl MuxChannel {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sender(&self) -> MuxSender {
        MuxSender {
            label: self.label.clone(),
            writer: self.writer.clone(),
        }
    }

    pub fn write(&self, content: Value) -> Result<(), TransportError> {
        self.writer.write(Envelope {
            label: self.label.clone(),
            content,
        })
    }

    /// Next routed value; `None` once the channel (or the underlying stream)
    /// has ended.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}
