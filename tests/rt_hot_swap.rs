use pdcore::config::EngineConfig;
use pdcore::device::ManualDevice;
use pdcore::engine::Engine;
use pdcore::harness::OfflineRenderer;
use pdcore::patch::MemoryPatchReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const A: &str = "node s sig~ 0.25\nnode out dac~ 0\nconnect s 0 out 0\n";
const B: &str = "node s sig~ -0.5\nnode out dac~ 0\nconnect s 0 out 0\n";

fn mono() -> EngineConfig {
    EngineConfig {
        channels_out: 1,
        block_size: 32,
        ..EngineConfig::default()
    }
}

#[test]
fn swap_takes_effect_at_next_block() {
    let mut renderer = OfflineRenderer::new(mono()).unwrap();
    renderer.load(A).unwrap();
    assert!(renderer.render(32).iter().all(|&s| s == 0.25));
    renderer.load(B).unwrap();
    assert!(renderer.render(32).iter().all(|&s| s == -0.5));
}

#[test]
fn swap_while_device_thread_runs() {
    let (device, driver) = ManualDevice::new();
    let mut reader = MemoryPatchReader::new();
    reader.insert("a.patch", A).insert("b.patch", B);
    let mut engine = Engine::new(mono(), device).unwrap().with_reader(reader);
    engine.open_patch("a.patch").unwrap();
    engine.start().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let audio = {
        let running = Arc::clone(&running);
        let blocks = Arc::clone(&blocks);
        let driver = driver.clone();
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if let Some(block) = driver.tick() {
                    blocks.lock().unwrap().push(block);
                }
                thread::yield_now();
            }
        })
    };

    let wait_for = |count: usize| {
        for _ in 0..5_000 {
            if blocks.lock().unwrap().len() >= count {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("audio thread stalled");
    };

    wait_for(20);
    engine.open_patch("b.patch").unwrap();
    let after_swap = blocks.lock().unwrap().len();
    wait_for(after_swap + 20);
    running.store(false, Ordering::Release);
    audio.join().unwrap();
    engine.stop();

    let blocks = blocks.lock().unwrap();
    let mut seen_b = false;
    for block in blocks.iter() {
        let first = block[0];
        assert!(
            block.iter().all(|&s| s == first),
            "block mixes two patches: {:?}",
            block
        );
        match first {
            f if f == 0.25 => assert!(!seen_b, "patch A rendered after patch B"),
            f if f == -0.5 => seen_b = true,
            other => panic!("unexpected sample {}", other),
        }
    }
    assert!(seen_b);
    assert!(engine.stats().swaps_applied >= 2);
    assert!(engine.stats().runtimes_freed >= 1);
}

#[test]
fn many_swaps_without_polling_never_drop_the_last() {
    let mut renderer = OfflineRenderer::new(mono()).unwrap();
    for i in 0..200 {
        let source = format!("node s sig~ {}\nnode out dac~ 0\nconnect s 0 out 0\n", i);
        renderer.load(&source).unwrap();
        if i % 3 == 0 {
            renderer.render(32);
        }
    }
    // Superseded swaps may be coalesced, the newest always lands.
    assert!(renderer.render(32).iter().all(|&s| s == 199.0));
}

#[test]
fn swaps_beyond_the_retire_ring_wait_for_collection() {
    use pdcore::plan::Plan;
    use pdcore::rt::{scheduler_pair, Runtime, RETIRE_QUEUE_CAPACITY};

    let config = mono();
    let graph = pdcore::patch::load(A).unwrap();
    let plan = Arc::new(Plan::compile(&graph, &config).unwrap());
    let (mut handle, mut scheduler) = scheduler_pair(&config);
    let mut out = vec![0.0; config.output_len()];

    for _ in 0..RETIRE_QUEUE_CAPACITY * 2 {
        handle.bind_graph(Runtime::new(Arc::clone(&plan))).unwrap();
    }
    // One swap per retire slot is published; the rest coalesce on the
    // control side instead of being dropped.
    assert_eq!(handle.pending(), 1);

    scheduler.process_block(None, &mut out);
    assert_eq!(handle.collect_garbage(), RETIRE_QUEUE_CAPACITY - 1);
    handle.flush();
    assert_eq!(handle.pending(), 0);

    scheduler.process_block(None, &mut out);
    assert!(out.iter().all(|&s| s == 0.25));
    assert!(!handle
        .drain_signals()
        .contains(&pdcore::invariant_rt::INV_RETIRE_OVERFLOW));
}
