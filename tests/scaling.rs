//! Scaling tests with many mutations, subscribers and objects.
//!
//! Tests various topologies and measures performance of key operations:
//! - Serialized application of concurrently submitted mutations
//! - Fan-out to many subscribers
//! - Views filtering a large cache
//! - Framing and rebuilding large images

use jsoncache::{
    ApplyChangeSet, CacheEngine, CacheMirror, CacheObject, CacheSnapshot, ChangeSet,
    EngineConfig, Feed, FrameAssembler, FrameDisassembler, Publisher, Selector, StreamEvent,
    SubscriptionHandle, View,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MUTATION_COUNT: usize = 10_000;
const OBJECT_COUNT: usize = 20_000;
const WAIT: Duration = Duration::from_secs(10);

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item, {:.0} items/sec)",
            self.name,
            ms,
            count,
            per_item,
            if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 }
        );
    }
}

fn object(i: usize, object_type: &str) -> CacheObject {
    CacheObject::new(format!("obj-{i:06}"), object_type, json!({ "i": i })).unwrap()
}

fn recv_change_set(handle: &SubscriptionHandle<ChangeSet>) -> ChangeSet {
    match handle.recv_timeout(WAIT).unwrap() {
        StreamEvent::Item(change_set) => change_set,
        other => panic!("Expected change set, got {:?}", other),
    }
}

// =============================================================================
// Test: Concurrent submitters keep their own order
// =============================================================================

#[test]
fn test_scaling_concurrent_submitters() {
    println!("\n=== Concurrent submitters ===");

    const THREADS: usize = 4;
    let per_thread = MUTATION_COUNT / THREADS;

    let engine = Arc::new(CacheEngine::new(EngineConfig::new("concurrent", MUTATION_COUNT * 2)).unwrap());
    let handle = SubscriptionHandle::unbounded();
    engine.subscribe(handle.subscriber()).unwrap();
    assert!(recv_change_set(&handle).is_image());

    // Change-set id -> (thread, sequence within thread)
    let submitted = Arc::new(Mutex::new(HashMap::new()));

    let timer = Timer::new("Submit and apply");
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let submitted = Arc::clone(&submitted);
            thread::spawn(move || {
                for seq in 0..per_thread {
                    let id = t * per_thread + seq;
                    let mutation =
                        ApplyChangeSet::from_parts(vec![object(id, "counter")], vec![]).unwrap();
                    submitted
                        .lock()
                        .insert(mutation.changes().id().to_string(), (t, seq));
                    engine.submit(mutation).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut last_seq: Vec<Option<usize>> = vec![None; THREADS];
    for _ in 0..MUTATION_COUNT {
        let change_set = recv_change_set(&handle);
        let (t, seq) = submitted.lock()[change_set.id()];
        if let Some(previous) = last_seq[t] {
            assert!(seq > previous, "thread {t} out of order: {seq} after {previous}");
        }
        last_seq[t] = Some(seq);
    }
    timer.report_with_count(MUTATION_COUNT);

    assert_eq!(engine.snapshot().len(), MUTATION_COUNT);
}

// =============================================================================
// Test: Fan-out to many subscribers
// =============================================================================

#[test]
fn test_scaling_many_subscribers_same_order() {
    println!("\n=== Fan-out to many subscribers ===");

    const SUBSCRIBERS: usize = 50;
    const MUTATIONS: usize = 1_000;

    let engine = CacheEngine::new(EngineConfig::new("fanout", MUTATIONS * 2)).unwrap();
    let handles: Vec<SubscriptionHandle<ChangeSet>> = (0..SUBSCRIBERS)
        .map(|_| SubscriptionHandle::unbounded())
        .collect();
    for handle in &handles {
        engine.subscribe(handle.subscriber()).unwrap();
    }

    let timer = Timer::new("Publish to all subscribers");
    let mut expected = Vec::with_capacity(MUTATIONS);
    for i in 0..MUTATIONS {
        let mutation = ApplyChangeSet::from_parts(vec![object(i, "t")], vec![]).unwrap();
        expected.push(mutation.changes().id().to_string());
        engine.submit(mutation).unwrap();
    }

    for handle in &handles {
        assert!(recv_change_set(handle).is_image());
        for id in &expected {
            assert_eq!(recv_change_set(handle).id(), id);
        }
    }
    timer.report_with_count(MUTATIONS * SUBSCRIBERS);
}

// =============================================================================
// Test: View over a large cache
// =============================================================================

#[test]
fn test_scaling_view_over_large_cache() {
    println!("\n=== View over {OBJECT_COUNT} objects ===");

    let objects = (0..OBJECT_COUNT).map(|i| object(i, if i % 4 == 0 { "wanted" } else { "other" }));
    let engine = Arc::new(
        CacheEngine::with_snapshot(
            EngineConfig::new("large", 1000),
            CacheSnapshot::from_objects(objects),
        )
        .unwrap(),
    );

    let selectors = Feed::new("selectors");
    let authorisations = Feed::new("authorisations");
    selectors.push(Selector::by_type("wanted")).unwrap();
    authorisations.push(Selector::all()).unwrap();
    let view = View::new(
        Arc::clone(&engine),
        Arc::new(selectors.clone()),
        Arc::new(authorisations.clone()),
    )
    .unwrap();

    let mirror = CacheMirror::new();
    let timer = Timer::new("Filtered image into mirror");
    view.subscribe(Arc::new(mirror.clone())).unwrap();

    let deadline = Instant::now() + WAIT;
    while mirror.len() != OBJECT_COUNT / 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    timer.report_with_count(OBJECT_COUNT);
    assert_eq!(mirror.len(), OBJECT_COUNT / 4);
    assert!(mirror.ids().iter().all(|id| mirror.get(id).unwrap().object_type() == "wanted"));
}

// =============================================================================
// Test: Framing a large image
// =============================================================================

#[test]
fn test_scaling_large_image_frame() {
    println!("\n=== Frame round trip of {OBJECT_COUNT} objects ===");

    let snapshot = CacheSnapshot::from_objects((0..OBJECT_COUNT).map(|i| object(i, "t")));
    let image = snapshot.to_image_change_set();

    let timer = Timer::new("Assemble");
    let messages = FrameAssembler::new().assemble(&image);
    timer.report_with_count(messages.len());
    assert_eq!(messages.len(), OBJECT_COUNT + 2);

    let timer = Timer::new("Encode to JSON text");
    let lines: Vec<String> = messages.iter().map(|m| m.to_text().unwrap()).collect();
    timer.report_with_count(lines.len());

    let mirror = CacheMirror::new();
    let mut disassembler = FrameDisassembler::new();
    disassembler.connect(mirror.clone()).unwrap();

    let timer = Timer::new("Decode and disassemble");
    for line in &lines {
        disassembler
            .on_message(jsoncache::FrameMessage::from_text(line).unwrap())
            .unwrap();
    }
    timer.report_with_count(lines.len());

    assert_eq!(mirror.snapshot(), snapshot);
    assert_eq!(mirror.last_change_set_id().as_deref(), Some(image.id()));
}
