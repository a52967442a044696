//! Producer/consumer scenarios across threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use buffer_queue::{
    create_buffer_queue, AcquireOutcome, Api, BufferItem, BufferQueueConsumer, BufferQueueProducer,
    ConsumerListener, Fence, ProducerListener, QueueBufferInput, QueueConfig, QueueError,
};
use parking_lot::Mutex;

#[derive(Default)]
struct FrameLog {
    available: Mutex<Vec<u64>>,
}

impl ConsumerListener for FrameLog {
    fn on_frame_available(&self, item: &BufferItem) {
        self.available.lock().push(item.frame_number);
    }
}

#[derive(Default)]
struct ReleaseCount(AtomicUsize);

impl ProducerListener for ReleaseCount {
    fn on_buffer_released(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn connected(config: QueueConfig) -> (BufferQueueProducer, BufferQueueConsumer, Arc<FrameLog>, Arc<ReleaseCount>) {
    let (producer, consumer) = create_buffer_queue(&config).expect("queue");
    let frames = Arc::new(FrameLog::default());
    consumer.connect(frames.clone(), false).expect("consumer connect");
    let releases = Arc::new(ReleaseCount::default());
    producer
        .connect(Some(releases.clone()), Api::Egl, false)
        .expect("producer connect");
    (producer, consumer, frames, releases)
}

fn produce(producer: &BufferQueueProducer) -> Result<usize, QueueError> {
    let out = producer.dequeue_buffer(16, 16, 0, 0)?;
    producer.request_buffer(out.slot)?;
    producer.queue_buffer(out.slot, QueueBufferInput::default())?;
    Ok(out.slot)
}

#[test]
fn dequeue_times_out_when_the_consumer_holds_everything() {
    let (producer, consumer, _frames, _releases) = connected(QueueConfig {
        dequeue_timeout_ms: Some(50),
        ..QueueConfig::default()
    });
    produce(&producer).expect("first");
    consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
    produce(&producer).expect("second");

    // One acquired, one queued: no slot left for the producer.
    let started = Instant::now();
    assert_eq!(producer.dequeue_buffer(16, 16, 0, 0).unwrap_err(), QueueError::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn blocked_dequeue_wakes_on_release() {
    let (producer, consumer, _frames, releases) = connected(QueueConfig::default());
    produce(&producer).expect("first");
    let held = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
    produce(&producer).expect("second");

    let waiter = {
        let producer = producer.clone();
        thread::spawn(move || producer.dequeue_buffer(16, 16, 0, 0))
    };
    thread::sleep(Duration::from_millis(20));
    consumer
        .release_buffer(held.slot, held.frame_number, Fence::NO_FENCE)
        .expect("release");

    let out = waiter.join().expect("join").expect("dequeue");
    assert_eq!(out.slot, held.slot);
    assert_eq!(releases.0.load(Ordering::SeqCst), 1);
}

#[test]
fn dequeue_waits_at_the_dequeued_limit() {
    let (producer, consumer, _frames, _releases) = connected(QueueConfig {
        max_dequeued_buffers: 1,
        dequeue_timeout_ms: Some(30),
        ..QueueConfig::default()
    });
    let first = producer.dequeue_buffer(16, 16, 0, 0).expect("dequeue");
    assert_eq!(producer.dequeue_buffer(16, 16, 0, 0).unwrap_err(), QueueError::TimedOut);

    producer.request_buffer(first.slot).expect("request");
    producer.queue_buffer(first.slot, QueueBufferInput::default()).expect("queue");
    let item = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
    consumer
        .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
        .expect("release");
    producer.dequeue_buffer(16, 16, 0, 0).expect("slot after release");
}

#[test]
fn cancelled_slot_never_reaches_the_consumer() {
    let (producer, consumer, frames, _releases) = connected(QueueConfig::default());
    let out = producer.dequeue_buffer(16, 16, 0, 0).expect("dequeue");
    producer.request_buffer(out.slot).expect("request");
    producer.cancel_buffer(out.slot, Fence::NO_FENCE).expect("cancel");
    assert!(matches!(
        consumer.acquire_buffer(0, 0).expect("acquire"),
        AcquireOutcome::NoBufferAvailable
    ));
    assert!(frames.available.lock().is_empty());
}

#[test]
fn frames_arrive_in_queue_order_across_threads() {
    let (producer, consumer, frames, _releases) = connected(QueueConfig {
        max_dequeued_buffers: 4,
        ..QueueConfig::default()
    });

    let consumer_thread = {
        let consumer = consumer.clone();
        thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 40 {
                match consumer.acquire_buffer(0, 0).expect("acquire") {
                    AcquireOutcome::Acquired(item) => {
                        seen.push(item.frame_number);
                        consumer
                            .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
                            .expect("release");
                    }
                    _ => thread::yield_now(),
                }
            }
            seen
        })
    };

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let producer = producer.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    produce(&producer).expect("produce");
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().expect("producer");
    }

    let seen = consumer_thread.join().expect("consumer");
    assert_eq!(seen, (1..=40).collect::<Vec<u64>>());
    assert_eq!(*frames.available.lock(), (1..=40).collect::<Vec<u64>>());
}

#[test]
fn consumer_never_holds_more_than_its_limit() {
    let (producer, consumer, _frames, _releases) = connected(QueueConfig {
        max_acquired_buffers: 2,
        max_dequeued_buffers: 2,
        ..QueueConfig::default()
    });
    for _ in 0..4 {
        produce(&producer).expect("produce");
    }
    let mut held = Vec::new();
    while let AcquireOutcome::Acquired(item) = consumer.acquire_buffer(0, 0).expect("acquire") {
        held.push(item);
    }
    // One past the limit is tolerated so a late release never stalls the producer.
    assert_eq!(held.len(), 3);
    assert_eq!(consumer.pending_count(), 1);
    for item in held {
        consumer
            .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
            .expect("release");
    }
}

#[test]
fn release_after_reconnect_is_stale() {
    let (producer, consumer, _frames, _releases) = connected(QueueConfig::default());
    produce(&producer).expect("produce");
    let item = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
    producer.disconnect(Api::Egl).expect("disconnect");
    assert!(matches!(
        consumer.release_buffer(item.slot, item.frame_number, Fence::NO_FENCE),
        Err(QueueError::StaleBufferSlot)
    ));
}

#[test]
fn release_fence_is_handed_to_the_next_dequeue() {
    let (producer, consumer, _frames, _releases) = connected(QueueConfig::default());
    produce(&producer).expect("produce");
    let item = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
    let fence = Fence::pending();
    consumer
        .release_buffer(item.slot, item.frame_number, fence.clone())
        .expect("release");
    let out = producer.dequeue_buffer(16, 16, 0, 0).expect("dequeue");
    assert_eq!(out.slot, item.slot);
    assert!(out.fence.same_as(&fence));
    assert!(!out.fence.wait(Duration::from_millis(1)));
    fence.signal();
    assert!(out.fence.wait(Duration::from_millis(1)));
}

#[cfg(feature = "proptest")]
mod prop {
    use super::*;
    use proptest::collection;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Dequeue,
        Queue,
        Cancel,
        Acquire,
        Release,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Dequeue),
            Just(Op::Queue),
            Just(Op::Cancel),
            Just(Op::Acquire),
            Just(Op::Release),
        ]
    }

    proptest! {
        /// No slot is ever handed to both ends, and the consumer stays within
        /// one buffer of its limit.
        #[test]
        fn slots_have_a_single_owner(ops in collection::vec(op(), 1..64), max_dequeued in 1usize..4) {
            let (producer, consumer, _frames, _releases) = connected(QueueConfig {
                max_dequeued_buffers: max_dequeued,
                dequeue_timeout_ms: Some(0),
                ..QueueConfig::default()
            });
            let mut dequeued: Vec<usize> = Vec::new();
            let mut acquired: Vec<BufferItem> = Vec::new();
            for op in ops {
                match op {
                    Op::Dequeue => match producer.dequeue_buffer(8, 8, 0, 0) {
                        Ok(out) => {
                            prop_assert!(!dequeued.contains(&out.slot));
                            prop_assert!(acquired.iter().all(|item| item.slot != out.slot));
                            producer.request_buffer(out.slot).expect("request");
                            dequeued.push(out.slot);
                        }
                        Err(err) => prop_assert!(err.is_retryable()),
                    },
                    Op::Queue => {
                        if let Some(slot) = dequeued.pop() {
                            producer.queue_buffer(slot, QueueBufferInput::default()).expect("queue");
                        }
                    }
                    Op::Cancel => {
                        if let Some(slot) = dequeued.pop() {
                            producer.cancel_buffer(slot, Fence::NO_FENCE).expect("cancel");
                        }
                    }
                    Op::Acquire => {
                        if let AcquireOutcome::Acquired(item) = consumer.acquire_buffer(0, 0).expect("acquire") {
                            prop_assert!(!dequeued.contains(&item.slot));
                            acquired.push(item);
                        }
                        prop_assert!(acquired.len() <= consumer.max_acquired_buffer_count() + 1);
                    }
                    Op::Release => {
                        if let Some(item) = acquired.pop() {
                            consumer
                                .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
                                .expect("release");
                        }
                    }
                }
                prop_assert!(dequeued.len() <= max_dequeued);
            }
        }
    }
}
