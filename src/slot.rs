// src/slot.rs
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Producer half of a capacity-one channel that keeps only the newest value.
///
/// The sender holds a receiver clone so it can evict a value the consumer has
/// not picked up yet. That clone keeps the channel open, so shutdown goes
/// through the stop signals rather than disconnection.
pub struct LatestSender<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
}

pub fn latest_slot<T>() -> (LatestSender<T>, Receiver<T>) {
    let (tx, rx) = bounded(1);
    (
        LatestSender {
            tx,
            evict: rx.clone(),
        },
        rx,
    )
}

impl<T> LatestSender<T> {
    /// Returns `true` when an unconsumed value was dropped to make room.
    pub fn publish(&self, item: T) -> bool {
        let mut item = item;
        let mut replaced = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return replaced,
                Err(TrySendError::Full(back)) => {
                    // The consumer may win the race; then the next try_send succeeds.
                    if self.evict.try_recv().is_ok() {
                        replaced = true;
                    }
                    item = back;
                }
                // Unreachable while `evict` is alive.
                Err(TrySendError::Disconnected(_)) => return replaced,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn keeps_only_latest() {
        let (tx, rx) = latest_slot();
        assert!(!tx.publish(1));
        assert!(tx.publish(2));
        assert!(tx.publish(3));
        assert_eq!(rx.try_recv(), Ok(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fresh_after_consumed() {
        let (tx, rx) = latest_slot();
        tx.publish("a");
        assert_eq!(rx.recv(), Ok("a"));
        assert!(!tx.publish("b"));
        assert_eq!(rx.recv(), Ok("b"));
    }

    #[test]
    fn concurrent_consumer_sees_monotonic_values() {
        let (tx, rx) = latest_slot();
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(v) = rx.recv_timeout(std::time::Duration::from_millis(200)) {
                seen.push(v);
                if v == 999 {
                    break;
                }
            }
            seen
        });
        for i in 0..1000 {
            tx.publish(i);
        }
        let seen = consumer.join().unwrap();
        assert_eq!(seen.last(), Some(&999));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
