//! Integration-level checks for the properties from spec.md §8 that need
//! more than one module to observe: fragment completeness (property 6),
//! no duplication/corruption while cleanup runs concurrently (property 7),
//! and the timeout response bound (property 8). Properties 1-5, 9 and 10
//! already have unit tests next to the code they characterise.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use readout_core::config::RequestHandlerConfig;
use readout_core::error_registry::FrameErrorRegistry;
use readout_core::latency_buffer::ring::RingLatencyBuffer;
use readout_core::latency_buffer::LatencyBuffer;
use readout_core::latency_buffer::LatencyBufferConf;
use readout_core::request_handler::RequestHandler;

use common::{data_request, CapturingFragmentSender, TestPayload, FRAME_SIZE};

const COMPONENT: u32 = 3;

fn handler_conf(timeout_ms: u32) -> RequestHandlerConfig {
    RequestHandlerConfig {
        pop_limit_pct: 0.8,
        pop_size_pct: 0.5,
        num_request_handling_threads: 4,
        request_timeout_ms: timeout_ms,
        warn_on_timeout: false,
        warn_about_empty_buffer: false,
        source_queue_timeout_ms: 100,
        source_queue_sleep_us: 50,
        send_partial_fragment_if_available: false,
        post_processing_delay_ticks: 0,
    }
}

/// Property 6: a fully-covered window's fragment contains exactly the
/// bytes of every frame whose timestamp lies in `[window_begin,
/// window_end)`, with no loss or duplication.
#[test]
fn property6_fragment_is_exactly_the_covered_frames() {
    let buffer = Arc::new(RingLatencyBuffer::<TestPayload>::new(&LatencyBufferConf { capacity: 4096, ..Default::default() }, COMPONENT).unwrap());
    let registry = Arc::new(FrameErrorRegistry::new());
    let sender = CapturingFragmentSender::new();
    let handler = Arc::new(RequestHandler::new(COMPONENT, Arc::clone(&buffer), registry, sender.clone()));
    handler.conf(4096, handler_conf(2000), Default::default()).unwrap();
    handler.start();

    let mut expected = Vec::new();
    for i in 0..200u64 {
        let ts = i * 25;
        let payload = TestPayload::at(ts);
        if (100..300).contains(&ts) {
            expected.extend_from_slice(&payload.frames);
        }
        buffer.write(payload);
    }

    handler.issue_request(data_request(100, 300, false, COMPONENT));
    let fragment = sender.wait_for_one(Duration::from_secs(1)).expect("fragment");
    handler.stop();

    assert_eq!(fragment.error_bits, 0);
    assert_eq!(fragment.body, expected);
    assert_eq!(fragment.body.len(), expected.len());
    assert_eq!(fragment.body.len() % FRAME_SIZE, 0);
}

/// Property 7: concurrent cleanup never corrupts or duplicates an
/// in-flight fragment assembly. A batch of requests is issued while a
/// background thread keeps writing (and therefore keeps triggering
/// cleanup); every request must get exactly one well-formed answer.
#[test]
fn property7_no_corruption_under_concurrent_cleanup() {
    let buffer = Arc::new(RingLatencyBuffer::<TestPayload>::new(&LatencyBufferConf { capacity: 200, ..Default::default() }, COMPONENT).unwrap());
    let registry = Arc::new(FrameErrorRegistry::new());
    let sender = CapturingFragmentSender::new();
    let handler = Arc::new(RequestHandler::new(COMPONENT, Arc::clone(&buffer), registry, sender.clone()));
    let mut conf = handler_conf(2000);
    conf.pop_limit_pct = 0.5;
    conf.pop_size_pct = 0.4;
    handler.conf(200, conf, Default::default()).unwrap();
    handler.start();

    let stop = Arc::new(AtomicUsize::new(0));
    let writer_buffer = Arc::clone(&buffer);
    let writer_stop = Arc::clone(&stop);
    let writer = std::thread::spawn(move || {
        let mut ts = 0u64;
        while writer_stop.load(Ordering::Relaxed) == 0 {
            writer_buffer.write(TestPayload::at(ts));
            ts += 25;
            std::thread::sleep(Duration::from_micros(200));
        }
    });

    std::thread::sleep(Duration::from_millis(100));

    const N: usize = 30;
    for i in 0..N {
        let base = (i as u64) * 250;
        handler.issue_request(data_request(base, base + 100, true, COMPONENT));
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while sender.count() < N && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    stop.store(1, Ordering::Relaxed);
    writer.join().unwrap();
    handler.stop();

    assert_eq!(sender.count(), N, "every issued request must receive exactly one answer");
    for fragment in sender.sent.lock().unwrap().iter() {
        assert_eq!(fragment.body.len() % FRAME_SIZE, 0, "a torn/duplicated piece would break frame alignment");
    }
}

/// Property 8: a request that can never be fully satisfied is answered
/// within `request_timeout_ms` plus the watcher's poll slice, never left
/// hanging indefinitely.
#[test]
fn property8_timeout_bound_is_honoured() {
    let buffer = Arc::new(RingLatencyBuffer::<TestPayload>::new(&LatencyBufferConf { capacity: 1024, ..Default::default() }, COMPONENT).unwrap());
    let registry = Arc::new(FrameErrorRegistry::new());
    let sender = CapturingFragmentSender::new();
    let handler = Arc::new(RequestHandler::new(COMPONENT, Arc::clone(&buffer), registry, sender.clone()));
    handler.conf(1024, handler_conf(80), Default::default()).unwrap();
    handler.start();

    buffer.write(TestPayload::at(0));

    let started = Instant::now();
    handler.issue_request(data_request(1_000_000, 1_000_100, false, COMPONENT));
    let fragment = sender.wait_for_one(Duration::from_millis(300)).expect("must not hang past the timeout bound");
    let elapsed = started.elapsed();
    handler.stop();

    assert!(elapsed <= Duration::from_millis(150), "timeout bound exceeded: {elapsed:?}");
    assert_ne!(fragment.error_bits & readout_core::transport::error_bits::INCOMPLETE, 0);
}
