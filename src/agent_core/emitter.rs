//! Stream Emitter: ordered client events for one request.
//!
//! Events go through a bounded channel to the transport. Exactly one
//! terminal event (`done` or `error`) is written; anything after it is
//! rejected. A dropped receiver means the client went away.

use tokio::sync::mpsc;

use super::errors::EmitError;
use super::types::{StreamEvent, ToolState};

pub struct StreamEmitter {
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
}

/// Create an emitter and the receiving end for the transport.
pub fn channel(capacity: usize) -> (StreamEmitter, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamEmitter {
            tx,
            terminated: false,
        },
        rx,
    )
}

impl StreamEmitter {
    /// Write one event, waiting for buffer space.
    pub async fn emit(&mut self, event: StreamEvent) -> Result<(), EmitError> {
        if self.terminated {
            return Err(EmitError::Terminated);
        }
        let terminal = event.is_terminal();
        self.tx
            .send(event)
            .await
            .map_err(|_| EmitError::Disconnected)?;
        if terminal {
            self.terminated = true;
        }
        Ok(())
    }

    pub async fn text(&mut self, content: impl Into<String>) -> Result<(), EmitError> {
        self.emit(StreamEvent::TextDelta {
            content: content.into(),
        })
        .await
    }

    pub async fn tool_status(&mut self, name: &str, state: ToolState) -> Result<(), EmitError> {
        self.emit(StreamEvent::ToolStatus {
            name: name.to_string(),
            state,
        })
        .await
    }

    pub async fn done(&mut self) -> Result<(), EmitError> {
        self.emit(StreamEvent::Done).await
    }

    pub async fn error(&mut self, error: impl Into<String>) -> Result<(), EmitError> {
        self.emit(StreamEvent::Error {
            error: error.into(),
        })
        .await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the client has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (mut emitter, mut rx) = channel(8);
        emitter.text("Hel").await.unwrap();
        emitter.text("lo").await.unwrap();
        emitter.tool_status("list_tasks", ToolState::Started).await.unwrap();
        emitter.done().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], StreamEvent::TextDelta { content: "Hel".into() });
        assert_eq!(seen[3], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_event() {
        let (mut emitter, mut rx) = channel(8);
        emitter.error("upstream failed").await.unwrap();
        assert!(emitter.is_terminated());
        assert_eq!(emitter.text("late").await, Err(EmitError::Terminated));
        assert_eq!(emitter.done().await, Err(EmitError::Terminated));

        assert!(rx.recv().await.unwrap().is_terminal());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_disconnected() {
        let (mut emitter, rx) = channel(8);
        drop(rx);
        assert!(emitter.is_closed());
        assert_eq!(emitter.text("anyone?").await, Err(EmitError::Disconnected));
        emitter.closed().await;
    }
}
