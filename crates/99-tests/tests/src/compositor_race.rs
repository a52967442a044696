//! A producer thread and a compositor thread sharing one transaction queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blast_queue::{BlastBufferQueue, BlastConfig, RecordingComposer, SurfaceControl, SurfaceId};
use buffer_queue::{Api, ProducerListener, QueueBufferInput, PIXEL_FORMAT_RGBA_8888};
use parking_lot::Mutex;

const SURFACE: u64 = 11;

#[derive(Default)]
struct Releases(AtomicUsize);

impl ProducerListener for Releases {
    fn on_buffer_released(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn surface_queue(composer: &Arc<RecordingComposer>) -> BlastBufferQueue {
    let config = BlastConfig {
        name: "race".to_owned(),
        ..BlastConfig::default()
    };
    let bbq = BlastBufferQueue::new(&config, composer.clone()).expect("queue");
    bbq.update(&SurfaceControl::new(SURFACE), 8, 8, PIXEL_FORMAT_RGBA_8888)
        .expect("update");
    composer.try_next().expect("surface setup transaction");
    bbq
}

fn frame_of(composer: &RecordingComposer, timeout: Duration) -> Option<u64> {
    let applied = composer.next_timeout(timeout)?;
    let frame = applied
        .transaction
        .layer(SurfaceId(SURFACE))
        .and_then(|layer| layer.buffer.as_ref())
        .map(|buffer| buffer.frame_number);
    composer.present(applied.transaction);
    frame
}

#[test]
fn every_frame_reaches_the_screen_in_order() {
    const FRAMES: u64 = 40;
    let composer = Arc::new(RecordingComposer::new());
    let bbq = surface_queue(&composer);
    let producer = bbq.producer();
    let releases = Arc::new(Releases::default());
    producer
        .connect(Some(releases.clone()), Api::Cpu, false)
        .expect("connect");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let compositor = {
        let composer = Arc::clone(&composer);
        let seen = Arc::clone(&seen);
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if let Some(frame) = frame_of(&composer, Duration::from_millis(10)) {
                    seen.lock().push(frame);
                    if frame == FRAMES {
                        break;
                    }
                }
            }
        })
    };

    for _ in 0..FRAMES {
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        producer.request_buffer(out.slot).expect("request");
        producer
            .queue_buffer(out.slot, QueueBufferInput::default())
            .expect("queue");
    }
    compositor.join().expect("compositor thread");

    assert_eq!(*seen.lock(), (1..=FRAMES).collect::<Vec<_>>());
    assert_eq!(composer.current_frame(SurfaceId(SURFACE)), Some(FRAMES));
    assert_eq!(bbq.last_acquired_frame_number(), FRAMES);
    // Everything but the frame still on screen came back.
    assert_eq!(releases.0.load(Ordering::SeqCst) as u64, FRAMES - 1);
}

#[test]
fn buffers_presented_after_the_queue_is_gone_are_dropped_quietly() {
    let composer = Arc::new(RecordingComposer::new());
    let bbq = surface_queue(&composer);
    let producer = bbq.producer();
    producer.connect(None, Api::Cpu, false).expect("connect");
    for _ in 0..2 {
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        producer.request_buffer(out.slot).expect("request");
        producer
            .queue_buffer(out.slot, QueueBufferInput::default())
            .expect("queue");
    }
    let first = composer.try_next().expect("first frame");
    let second = composer.try_next().expect("second frame");
    drop(producer);
    drop(bbq);

    composer.present(first.transaction);
    composer.present(second.transaction);
    assert_eq!(composer.current_frame(SurfaceId(SURFACE)), Some(2));
    composer.remove_surface(SurfaceId(SURFACE));
    assert_eq!(composer.current_frame(SurfaceId(SURFACE)), None);
}
