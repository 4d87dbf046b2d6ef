use svclog_core::{Parser, RingBuffer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::task::Tomb;

/// An entry pulled off one service's ring buffer, tagged with the service it
/// came from so the gatherer can multiplex many services onto one client.
#[derive(Debug, Clone)]
pub struct PulledEntry {
    pub service: String,
    pub entry: svclog_core::Entry,
}

/// Drives one tailing iterator to completion, parsing its bytes into
/// entries and forwarding them on a shared channel.
///
/// A puller always closes its iterator on exit, cancellation or not: the
/// iterator is owned by the puller's task and is simply dropped when that
/// task returns, which is enough to let the ring buffer prune its
/// notification registry.
pub struct Puller {
    tomb: Tomb,
}

impl Puller {
    pub fn spawn(service: String, buffer: RingBuffer, sender: mpsc::Sender<PulledEntry>) -> Self {
        let cancel = CancellationToken::new();
        let dying = cancel.clone();
        let handle = tokio::spawn(async move {
            Self::run(service, buffer, sender, dying).await;
        });
        Self {
            tomb: Tomb::new(cancel, handle),
        }
    }

    async fn run(service: String, buffer: RingBuffer, sender: mpsc::Sender<PulledEntry>, dying: CancellationToken) {
        let mut iter = buffer.tail_iterator();
        let mut parser = Parser::new();

        loop {
            let Some(chunk) = iter.next(&dying).await else {
                break;
            };
            parser.feed(&chunk);
            while let Some(entry) = parser.next() {
                let pulled = PulledEntry {
                    service: service.clone(),
                    entry,
                };
                tokio::select! {
                    result = sender.send(pulled) => {
                        if result.is_err() {
                            return;
                        }
                    }
                    _ = dying.cancelled() => return,
                }
            }
        }

        if let Some(entry) = parser.flush() {
            let _ = sender.send(PulledEntry { service, entry }).await;
        }
    }

    pub fn kill(&self) {
        self.tomb.kill();
    }

    pub async fn wait(&self) {
        self.tomb.wait().await;
    }

    pub async fn kill_and_wait(&self) {
        self.tomb.kill_and_wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn puller_forwards_parsed_entries() {
        let buffer = RingBuffer::new(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let puller = Puller::spawn("svc1".to_string(), buffer.clone(), tx);

        buffer
            .write(b"2024-01-01T00:00:00.000Z [svc1] line one\n")
            .unwrap();
        let pulled = rx.recv().await.unwrap();
        assert_eq!(pulled.service, "svc1");
        assert_eq!(pulled.entry.message, "line one");

        puller.kill_and_wait().await;
    }

    #[tokio::test]
    async fn puller_exits_when_buffer_closes() {
        let buffer = RingBuffer::new(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let puller = Puller::spawn("svc1".to_string(), buffer.clone(), tx);

        buffer.write(b"2024-01-01T00:00:00.000Z [svc1] last\n").unwrap();
        buffer.close();
        let pulled = rx.recv().await.unwrap();
        assert_eq!(pulled.entry.message, "last");

        puller.wait().await;
        assert!(rx.recv().await.is_none());
    }
}
