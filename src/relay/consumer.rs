//! Application-side consumers of relayed units and feedback
//!
//! Consumer methods run on engine threads. Implementations must return quickly
//! and must not call back into `stop` for the same pipeline from `on_data_unit`
//! (stopping waits for the streaming threads that are running the callback).

use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::TerminalEvent;
use crate::pipeline::types::{DataUnit, MediaKind, PipelineId, StatsSample};

/// Where a data unit came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOrigin {
    pub pipeline: PipelineId,
    /// Name of the sink stage that produced the unit
    pub sink: Arc<str>,
    /// Media kind declared for the sink, if any
    pub kind: Option<MediaKind>,
}

/// Receives everything a running pipeline hands to the application
pub trait PipelineConsumer: Send + Sync {
    /// A completed data unit, already copied out of engine memory
    fn on_data_unit(&self, origin: &UnitOrigin, unit: DataUnit);

    /// A decoded transport statistics snapshot
    fn on_stats(&self, _pipeline: PipelineId, _sample: StatsSample) {}

    /// The engine ended the pipeline; what to do about it is up to the application
    fn on_terminal(&self, _pipeline: PipelineId, _event: &TerminalEvent) {}
}

/// Event forwarded by [`ChannelConsumer`]
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Unit { origin: UnitOrigin, unit: DataUnit },
    Stats { pipeline: PipelineId, sample: StatsSample },
    Terminal { pipeline: PipelineId, event: TerminalEvent },
}

/// Forwards consumer callbacks into a bounded tokio channel
///
/// Uses `try_send` so the engine thread never waits on the application: when
/// the channel is full the event is dropped and counted. Terminal events are
/// the exception; a full channel hands them to a helper thread that waits for
/// room, and they only count as dropped once the receiver is gone.
pub struct ChannelConsumer {
    tx: mpsc::Sender<RelayEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn forward(&self, event: RelayEvent) {
        match self.tx.try_send(event) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("ChannelConsumer: receiver dropped, discarding relay events");
                }
            }
        }
    }
}

impl PipelineConsumer for ChannelConsumer {
    fn on_data_unit(&self, origin: &UnitOrigin, unit: DataUnit) {
        self.forward(RelayEvent::Unit {
            origin: origin.clone(),
            unit,
        });
    }

    fn on_stats(&self, pipeline: PipelineId, sample: StatsSample) {
        self.forward(RelayEvent::Stats { pipeline, sample });
    }

    fn on_terminal(&self, pipeline: PipelineId, event: &TerminalEvent) {
        let event = RelayEvent::Terminal {
            pipeline,
            event: event.clone(),
        };
        match self.tx.try_send(event) {
            Ok(_) => {}
            // must not be lost behind a burst of units
            Err(TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                let dropped = self.dropped.clone();
                std::thread::spawn(move || {
                    if tx.blocking_send(event).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("ChannelConsumer: receiver dropped, pipeline {} terminal event lost", pipeline);
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("ChannelConsumer: receiver dropped, pipeline {} terminal event lost", pipeline);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn origin() -> UnitOrigin {
        UnitOrigin {
            pipeline: PipelineId(1),
            sink: Arc::from("rtpsink"),
            kind: None,
        }
    }

    fn unit(byte: u8) -> DataUnit {
        DataUnit {
            data: Bytes::from(vec![byte; 4]),
            duration: None,
            pts: None,
        }
    }

    #[test]
    fn test_forwards_in_order() {
        let (consumer, mut rx) = ChannelConsumer::new(8);
        consumer.on_data_unit(&origin(), unit(1));
        consumer.on_stats(PipelineId(1), StatsSample::default());
        consumer.on_data_unit(&origin(), unit(2));

        match rx.try_recv().unwrap() {
            RelayEvent::Unit { unit, origin } => {
                assert_eq!(unit.data[0], 1);
                assert_eq!(&*origin.sink, "rtpsink");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), RelayEvent::Stats { .. }));
        assert!(matches!(rx.try_recv().unwrap(), RelayEvent::Unit { .. }));
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (consumer, _rx) = ChannelConsumer::new(2);
        for i in 0..5 {
            consumer.on_data_unit(&origin(), unit(i));
        }
        assert_eq!(consumer.dropped(), 3);
    }

    #[test]
    fn test_closed_channel_counts_drops() {
        let (consumer, rx) = ChannelConsumer::new(2);
        drop(rx);
        consumer.on_data_unit(&origin(), unit(0));
        consumer.on_stats(PipelineId(1), StatsSample::default());
        assert_eq!(consumer.dropped(), 2);
    }

    #[test]
    fn test_terminal_on_closed_channel_is_counted() {
        let (consumer, rx) = ChannelConsumer::new(2);
        drop(rx);
        consumer.on_terminal(PipelineId(1), &TerminalEvent::EndOfStream);
        assert_eq!(consumer.dropped(), 1);
    }

    #[test]
    fn test_terminal_waiting_for_room_is_counted_when_receiver_goes() {
        let (consumer, rx) = ChannelConsumer::new(1);
        consumer.on_data_unit(&origin(), unit(0));
        consumer.on_terminal(PipelineId(1), &TerminalEvent::EndOfStream);
        assert_eq!(consumer.dropped(), 0);
        drop(rx);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while consumer.dropped() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(consumer.dropped(), 1);
    }

    #[tokio::test]
    async fn test_terminal_survives_full_channel() {
        let (consumer, mut rx) = ChannelConsumer::new(1);
        consumer.on_data_unit(&origin(), unit(0));
        consumer.on_terminal(PipelineId(1), &TerminalEvent::EndOfStream);

        assert!(matches!(rx.recv().await, Some(RelayEvent::Unit { .. })));
        match rx.recv().await {
            Some(RelayEvent::Terminal { event, .. }) => assert_eq!(event, TerminalEvent::EndOfStream),
            other => panic!("unexpected {:?}", other),
        }
    }
}
