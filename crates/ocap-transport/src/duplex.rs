use tokio::sync::mpsc;

use crate::error::TransportError;

/// Internal frame: a value, a clean end, or a failure that propagates to the
/// remote side.
#[derive(Debug)]
enum Frame<T> {
    Value(T),
    End,
    Fail(String),
}

/// Producer half of a duplex channel. Cloneable; writes return once queued.
pub struct DuplexWriter<T> {
    tx: mpsc::UnboundedSender<Frame<T>>,
}

impl<T> Clone for DuplexWriter<T> {
    fn clone(&self) -> Self {
        DuplexWriter {
            tx: self.tx.clone(),
        }
    }
}

impl<T> DuplexWriter<T> {
    pub fn write(&self, value: T) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Value(value))
            .map_err(|_| TransportError::Closed)
    }

    /// Terminal: the remote reader observes a clean end of stream.
    pub fn end(&self) {
        let _ = self.tx.send(Frame::End);
    }

    /// Terminal: the remote reader observes a failure.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Frame::Fail(reason.into()));
    }
}

/// Consumer half of a duplex channel.
pub struct DuplexReader<T> {
    rx: mpsc::UnboundedReceiver<Frame<T>>,
    done: bool,
}

impl<T> DuplexReader<T> {
    /// Next incoming value; `None` once the channel has ended. A remote
    /// failure surfaces as `Some(Err(..))` and then the channel is done.
    pub async fn next(&mut self) -> Option<Result<T, TransportError>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Frame::Value(value)) => Some(Ok(value)),
            Some(Frame::End) | None => {
                self.done = true;
                None
            }
            Some(Frame::Fail(reason)) => {
                self.done = true;
                Some(Err(TransportError::Failed(reason)))
            }
        }
    }

    /// Run `handler` over each incoming value in arrival order until the
    /// channel ends. A handler error or remote failure stops the drain.
    pub async fn drain<F>(&mut self, mut handler: F) -> Result<(), TransportError>
    where
        F: FnMut(T) -> Result<(), TransportError>,
    {
        while let Some(item) = self.next().await {
            handler(item?)?;
        }
        Ok(())
    }
}

/// One end of a duplex channel: writes go to the linked remote end, reads
/// come from it.
pub struct DuplexEnd<T> {
    writer: DuplexWriter<T>,
    reader: DuplexReader<T>,
}

impl<T> DuplexEnd<T> {
    pub fn write(&self, value: T) -> Result<(), TransportError> {
        self.writer.write(value)
    }

    pub fn end(&self) {
        self.writer.end();
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.writer.fail(reason);
    }

    pub async fn next(&mut self) -> Option<Result<T, TransportError>> {
        self.reader.next().await
    }

    pub async fn drain<F>(&mut self, handler: F) -> Result<(), TransportError>
    where
        F: FnMut(T) -> Result<(), TransportError>,
    {
        self.reader.drain(handler).await
    }

    pub fn writer(&self) -> DuplexWriter<T> {
        self.writer.clone()
    }

    pub fn split(self) -> (DuplexWriter<T>, DuplexReader<T>) {
        (self.writer, self.reader)
    }
}

/// Two linked ends: whatever one writes, the other reads.
pub fn duplex_pair<T>() -> (DuplexEnd<T>, DuplexEnd<T>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let left = DuplexEnd {
        writer: DuplexWriter { tx: tx_a },
        reader: DuplexReader { rx: rx_b, done: false },
    };
    let right = DuplexEnd {
        writer: DuplexWriter { tx: tx_b },
        reader: DuplexReader { rx: rx_a, done: false },
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_arrive_in_write_order() {
        let (left, mut right) = duplex_pair::<u32>();
        for n in 0..4 {
            left.write(n).unwrap();
        }
        left.end();
        let mut seen = Vec::new();
        right
            .drain(|n| {
                seen.push(n);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failure_propagates_to_remote_reader() {
        let (left, mut right) = duplex_pair::<u32>();
        left.write(1).unwrap();
        left.fail("boom");
        assert_eq!(right.next().await.unwrap().unwrap(), 1);
        match right.next().await {
            Some(Err(TransportError::Failed(reason))) => assert_eq!(reason, "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(right.next().await.is_none());
    }

    #[tokio::test]
    async fn write_after_remote_drop_reports_closed() {
        let (left, right) = duplex_pair::<u32>();
        drop(right);
        assert!(matches!(left.write(1), Err(TransportError::Closed)));
    }
}
