use std::time::Duration;

use tracing::trace;

use crate::clock;

use super::event::{EventVisitor, PerfEvent, SourceId};
use super::merge::EventMerger;

/// Minimum age an event must reach before dispatch. Ring buffers are read
/// concurrently, so recent events may still be missing from slower sources;
/// holding events back by more than the expected cross-source skew makes
/// out-of-order release impossible in practice.
pub const DEFAULT_SAFETY_DELAY: Duration = Duration::from_millis(100);

/// Orders events from many sources and dispatches them to visitors once
/// they are older than the safety delay.
///
/// Not internally synchronized; the owning task serializes all calls.
pub struct DelayedEventProcessor {
    merger: EventMerger,
    safety_delay_ns: u64,
    last_processed_ns: u64,
    processed: u64,
    discarded_out_of_order: u64,
    visitors: Vec<Box<dyn EventVisitor>>,
}

impl DelayedEventProcessor {
    pub fn new(safety_delay: Duration) -> Self {
        Self {
            merger: EventMerger::new(),
            safety_delay_ns: safety_delay.as_nanos() as u64,
            last_processed_ns: 0,
            processed: 0,
            discarded_out_of_order: 0,
            visitors: Vec::new(),
        }
    }

    /// Buffer an event from the given source.
    pub fn add(&mut self, source: SourceId, event: PerfEvent) {
        self.merger.push(source, event);
    }

    /// Register a visitor; visitors receive each event once, in
    /// registration order.
    pub fn add_visitor(&mut self, visitor: Box<dyn EventVisitor>) {
        self.visitors.push(visitor);
    }

    pub fn clear_visitors(&mut self) {
        self.visitors.clear();
    }

    /// Dispatch every buffered event regardless of age. Shutdown path.
    pub fn process_all(&mut self) {
        self.dispatch_up_to(u64::MAX);
    }

    /// Dispatch events older than the safety delay.
    pub fn process_old(&mut self) {
        self.process_old_at(clock::monotonic_ns());
    }

    /// Dispatch events with `timestamp <= now - safety_delay`.
    pub fn process_old_at(&mut self, now_ns: u64) {
        let cutoff = now_ns.saturating_sub(self.safety_delay_ns);
        self.dispatch_up_to(cutoff);
    }

    fn dispatch_up_to(&mut self, cutoff_ns: u64) {
        while let Some(top) = self.merger.top() {
            if top.timestamp_ns > cutoff_ns {
                break;
            }
            let Some(event) = self.merger.pop() else {
                break;
            };

            // An event older than the watermark slipped past the safety
            // delay; dispatching it would break the ordering guarantee
            // visitors rely on.
            if event.timestamp_ns < self.last_processed_ns {
                self.discarded_out_of_order += 1;
                trace!(
                    timestamp_ns = event.timestamp_ns,
                    watermark_ns = self.last_processed_ns,
                    "discarding late event",
                );
                continue;
            }

            for visitor in &mut self.visitors {
                visitor.visit(&event);
            }
            self.last_processed_ns = event.timestamp_ns;
            self.processed += 1;
        }
    }

    /// Events dispatched to visitors so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Events dropped for arriving older than the dispatch watermark.
    pub fn discarded_out_of_order(&self) -> u64 {
        self.discarded_out_of_order
    }

    /// Events currently buffered and awaiting the safety delay.
    pub fn buffered(&self) -> usize {
        self.merger.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::super::event::PerfEventKind;
    use super::*;

    const MS: u64 = 1_000_000;

    fn event(ts_ms: u64) -> PerfEvent {
        PerfEvent {
            timestamp_ns: ts_ms * MS,
            pid: 1,
            tid: 1,
            kind: PerfEventKind::Sample { ip: 0 },
        }
    }

    /// Records observed timestamps (in ms) into a shared vec.
    struct Recorder {
        seen: Arc<parking_lot::Mutex<Vec<u64>>>,
    }

    impl EventVisitor for Recorder {
        fn visit(&mut self, event: &PerfEvent) {
            self.seen.lock().push(event.timestamp_ns / MS);
        }
    }

    fn processor_with_recorder(
        delay: Duration,
    ) -> (DelayedEventProcessor, Arc<parking_lot::Mutex<Vec<u64>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut processor = DelayedEventProcessor::new(delay);
        processor.add_visitor(Box::new(Recorder {
            seen: Arc::clone(&seen),
        }));
        (processor, seen)
    }

    #[test]
    fn test_process_all_merges_two_sources() {
        let (mut processor, seen) = processor_with_recorder(DEFAULT_SAFETY_DELAY);
        for ts in [10, 20, 30] {
            processor.add(1, event(ts));
        }
        for ts in [15, 25, 35] {
            processor.add(2, event(ts));
        }

        processor.process_all();

        assert_eq!(*seen.lock(), vec![10, 15, 20, 25, 30, 35]);
        assert_eq!(processor.processed(), 6);
        assert_eq!(processor.buffered(), 0);
    }

    #[test]
    fn test_process_old_gates_on_safety_delay() {
        let (mut processor, seen) = processor_with_recorder(Duration::from_millis(100));
        processor.add(1, event(100));
        processor.add(1, event(150));

        processor.process_old_at(200 * MS);
        assert_eq!(*seen.lock(), vec![100]);
        assert_eq!(processor.buffered(), 1);

        processor.process_old_at(260 * MS);
        assert_eq!(*seen.lock(), vec![100, 150]);
        assert_eq!(processor.buffered(), 0);
    }

    #[test]
    fn test_late_event_discarded_and_counted() {
        let (mut processor, seen) = processor_with_recorder(Duration::from_millis(100));
        processor.add(1, event(100));
        processor.process_old_at(250 * MS);
        assert_eq!(*seen.lock(), vec![100]);

        // Violates the skew bound: older than the watermark.
        processor.add(2, event(50));
        processor.process_old_at(300 * MS);

        assert_eq!(*seen.lock(), vec![100]);
        assert_eq!(processor.discarded_out_of_order(), 1);
    }

    #[test]
    fn test_visitors_invoked_in_registration_order() {
        struct Tagger {
            tag: u64,
            log: Arc<parking_lot::Mutex<Vec<u64>>>,
        }
        impl EventVisitor for Tagger {
            fn visit(&mut self, _event: &PerfEvent) {
                self.log.lock().push(self.tag);
            }
        }

        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut processor = DelayedEventProcessor::new(DEFAULT_SAFETY_DELAY);
        for tag in [1, 2, 3] {
            processor.add_visitor(Box::new(Tagger {
                tag,
                log: Arc::clone(&log),
            }));
        }

        processor.add(1, event(10));
        processor.add(1, event(20));
        processor.process_all();

        // Event N reaches every visitor before event N+1.
        assert_eq!(*log.lock(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_clear_visitors() {
        let counter = Arc::new(AtomicU64::new(0));

        struct Counting {
            counter: Arc<AtomicU64>,
        }
        impl EventVisitor for Counting {
            fn visit(&mut self, _event: &PerfEvent) {
                self.counter.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut processor = DelayedEventProcessor::new(DEFAULT_SAFETY_DELAY);
        processor.add_visitor(Box::new(Counting {
            counter: Arc::clone(&counter),
        }));
        processor.clear_visitors();

        processor.add(1, event(10));
        processor.process_all();

        assert_eq!(counter.load(Ordering::Relaxed), 0);
        // Still drained and counted as processed.
        assert_eq!(processor.processed(), 1);
    }

    #[test]
    fn test_equal_to_watermark_is_dispatched() {
        let (mut processor, seen) = processor_with_recorder(Duration::from_millis(10));
        processor.add(1, event(100));
        processor.process_old_at(200 * MS);

        // Equal timestamps do not violate the ordering guarantee.
        processor.add(2, event(100));
        processor.process_old_at(200 * MS);

        assert_eq!(*seen.lock(), vec![100, 100]);
        assert_eq!(processor.discarded_out_of_order(), 0);
    }
}
