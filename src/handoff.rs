//! Single-slot "latest value" handoff between threads.
//!
//! The writer overwrites whatever the reader has not picked up yet; the reader
//! waits with a bound. Stale values are dropped, never queued.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

pub fn latest_value<T>() -> (SlotWriter<T>, SlotReader<T>) {
    let (tx, rx) = channel::bounded(1);
    (SlotWriter { tx, evict: rx.clone() }, SlotReader { rx })
}

#[derive(Clone)]
pub struct SlotWriter<T> {
    tx: Sender<T>,
    // Lets the writer drop the unread value itself
    evict: Receiver<T>,
}

impl<T> SlotWriter<T> {
    /// Store `value`, replacing any unread one. Returns true if a value was replaced.
    pub fn publish(&self, value: T) -> bool {
        let mut pending = value;
        let mut replaced = false;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return replaced,
                Err(TrySendError::Full(v)) => {
                    if self.evict.try_recv().is_ok() {
                        replaced = true;
                    }
                    pending = v;
                }
                // The writer holds a receiver, so the channel cannot close under it
                Err(TrySendError::Disconnected(_)) => return replaced,
            }
        }
    }
}

pub struct SlotReader<T> {
    rx: Receiver<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    Timeout,
    /// Every writer has been dropped and the slot is empty.
    Closed,
}

impl<T> SlotReader<T> {
    /// Wait at most `timeout` for the latest value.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, SlotError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SlotError::Timeout,
            RecvTimeoutError::Disconnected => SlotError::Closed,
        })
    }

    pub fn try_latest(&self) -> Result<Option<T>, SlotError> {
        match self.rx.try_recv() {
            Ok(v) => Ok(Some(v)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SlotError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_overwrite_keeps_only_latest() {
        let (writer, reader) = latest_value();
        assert!(!writer.publish(1));
        assert!(writer.publish(2));
        assert!(writer.publish(3));
        assert_eq!(reader.recv_timeout(Duration::from_millis(10)), Ok(3));
        assert_eq!(reader.try_latest(), Ok(None));
    }

    #[test]
    fn test_empty_slot_times_out() {
        let (_writer, reader) = latest_value::<u32>();
        assert_eq!(reader.recv_timeout(Duration::from_millis(1)), Err(SlotError::Timeout));
    }

    #[test]
    fn test_cross_thread_delivery() {
        let (writer, reader) = latest_value();
        let handle = thread::spawn(move || {
            for i in 0..100u32 {
                writer.publish(i);
            }
            writer
        });
        let writer = handle.join().unwrap();
        // Only the last value survives the burst
        assert_eq!(reader.recv_timeout(Duration::from_millis(50)), Ok(99));
        drop(writer);
    }
}
