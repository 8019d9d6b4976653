use pdcore::config::{ConfigError, EngineConfig};
use pdcore::device::{AudioDevice, ManualDevice, NullDevice, OpenError, StreamHandle};
use pdcore::engine::{create_engine, Diagnostic, Engine, EngineError, RunState};
use pdcore::graph::GraphError;
use pdcore::invariant_rt::INVARIANT_QUEUE_CAPACITY;
use pdcore::patch::{MemoryPatchReader, ValidationError};
use pdcore::rt::Scheduler;
use pdcore::Message;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SIG: &str = "node s sig~ 0.5\nnode out dac~ 0\nconnect s 0 out 0\nreceive level s\n";

fn mono() -> EngineConfig {
    EngineConfig {
        channels_out: 1,
        block_size: 4,
        ..EngineConfig::default()
    }
}

fn collect_diagnostics(engine: Engine) -> (Engine, Arc<Mutex<Vec<Diagnostic>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let engine = engine.with_diagnostics(move |d| sink.lock().unwrap().push(d.clone()));
    (engine, seen)
}

#[test]
fn invalid_config_is_rejected() {
    let config = EngineConfig {
        block_size: 0,
        ..EngineConfig::default()
    };
    let (device, _driver) = ManualDevice::new();
    assert!(matches!(
        Engine::new(config, device),
        Err(EngineError::Config(ConfigError::BlockSize(0)))
    ));
}

#[test]
fn stop_and_start_keep_the_patch() {
    let (device, driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap();
    engine.open_patch_source(SIG).unwrap();
    assert!(engine.has_patch());

    engine.start().unwrap();
    assert_eq!(driver.tick(), Some(vec![0.5; 4]));
    assert_eq!(engine.stop(), RunState::Stopped);
    assert_eq!(engine.stop(), RunState::Stopped);
    assert!(driver.tick().is_none());

    engine.send_float("level", -0.5).unwrap();
    engine.start().unwrap();
    assert_eq!(driver.tick(), Some(vec![-0.5; 4]));
    assert_eq!(driver.opens(), 2);
}

#[test]
fn close_patch_renders_silence() {
    let (device, driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap();
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();
    driver.tick().unwrap();

    engine.close_patch();
    engine.close_patch();
    assert!(!engine.has_patch());
    assert_eq!(driver.tick(), Some(vec![0.0; 4]));
    let stats = *engine.poll();
    assert_eq!(stats.unbinds_applied, 1);
    assert_eq!(stats.silent_blocks, 1);
    assert_eq!(stats.blocks_rendered, 2);
}

#[test]
fn missing_patch_is_not_found() {
    let mut reader = MemoryPatchReader::new();
    reader.insert("present.patch", SIG);
    let (device, _driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap().with_reader(reader);

    match engine.open_patch("absent.patch") {
        Err(EngineError::NotFound(path)) => assert_eq!(path, PathBuf::from("absent.patch")),
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(!engine.has_patch());
    engine.open_patch("present.patch").unwrap();
    assert!(engine.has_patch());
}

#[test]
fn missing_file_on_disk_is_not_found() {
    let (device, _driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap();
    let path = std::env::temp_dir().join(format!("pdcore-missing-{}.patch", std::process::id()));
    assert!(matches!(
        engine.open_patch(&path),
        Err(EngineError::NotFound(p)) if p == path
    ));
}

#[test]
fn bad_patch_keeps_the_current_one() {
    let (device, driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap();
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();

    match engine.open_patch_source("node s sig~ 1\nnode out dac~ 0\nconnect s 0 nowhere 0\n") {
        Err(EngineError::Validation(e)) => assert!(e.to_string().contains("line 3"), "{e}"),
        other => panic!("expected a validation error, got {:?}", other),
    }
    match engine.open_patch_source("node s sig~ 1\nwire s out\n") {
        Err(EngineError::Parse(e)) => assert_eq!(e.line, 2),
        other => panic!("expected a parse error, got {:?}", other),
    }
    // dac~ 1 does not exist in a mono stream.
    assert!(matches!(
        engine.open_patch_source("node s sig~ 1\nnode out dac~ 1\nconnect s 0 out 0\n"),
        Err(EngineError::Validation(_))
    ));
    assert_eq!(driver.tick(), Some(vec![0.5; 4]));
}

#[test]
fn cyclic_patch_is_never_bound() {
    let (device, driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap();
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();
    assert_eq!(driver.tick(), Some(vec![0.5; 4]));
    assert_eq!(engine.poll().swaps_applied, 1);

    let cyclic = "node a through~\nnode b through~\nnode out dac~ 0\n\
                  connect a 0 b 0\nconnect b 0 a 0\nconnect b 0 out 0\n";
    assert!(matches!(
        engine.open_patch_source(cyclic),
        Err(EngineError::Validation(ValidationError::Graph(GraphError::Cycle { .. })))
    ));
    assert_eq!(driver.tick(), Some(vec![0.5; 4]));
    assert_eq!(engine.poll().swaps_applied, 1);
    assert!(engine.has_patch());
}

#[test]
fn stats_are_exact_only_while_the_signal_ring_keeps_up() {
    let (device, driver) = ManualDevice::new();
    let mut engine = Engine::new(mono(), device).unwrap();
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();
    driver.tick();
    assert_eq!(engine.poll().blocks_rendered, 1);

    // One id per bound block; the ring keeps the first CAP of them.
    for _ in 0..INVARIANT_QUEUE_CAPACITY + 500 {
        driver.tick();
    }
    assert_eq!(
        engine.poll().blocks_rendered,
        1 + INVARIANT_QUEUE_CAPACITY as u64
    );

    for _ in 0..10 {
        driver.tick();
    }
    assert_eq!(
        engine.poll().blocks_rendered,
        11 + INVARIANT_QUEUE_CAPACITY as u64
    );
}

#[test]
fn backlog_overflow_reports_dropped_messages() {
    let config = EngineConfig {
        message_capacity: 4,
        ..mono()
    };
    let (device, driver) = ManualDevice::new();
    let (mut engine, seen) = collect_diagnostics(Engine::new(config, device).unwrap());
    engine.open_patch_source(SIG).unwrap();

    for i in 0..6 {
        engine.send_float("level", i as f64).unwrap();
    }
    assert_eq!(engine.stats().messages_dropped, 2);
    let dropped: Vec<Message> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|d| match d {
            Diagnostic::MessageDropped(m) => Some(*m),
            _ => None,
        })
        .collect();
    assert_eq!(
        dropped,
        vec![
            Message::float("level", 0.0).unwrap(),
            Message::float("level", 1.0).unwrap()
        ]
    );

    // The patch swap itself was never dropped.
    engine.start().unwrap();
    assert_eq!(driver.tick(), Some(vec![5.0; 4]));
    engine.poll();
    assert_eq!(engine.stats().messages_applied, 4);
}

#[test]
fn unrouted_messages_are_reported() {
    let (device, driver) = ManualDevice::new();
    let (mut engine, seen) = collect_diagnostics(Engine::new(mono(), device).unwrap());
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();
    engine.send_bang("nobody").unwrap();
    engine.send_bang("nobody").unwrap();
    driver.tick().unwrap();
    engine.poll();

    assert_eq!(engine.stats().messages_unrouted, 2);
    assert!(seen
        .lock()
        .unwrap()
        .contains(&Diagnostic::MessagesUnrouted { count: 2 }));
}

#[test]
fn sanitized_blocks_are_reported() {
    let config = EngineConfig {
        channels_in: 1,
        ..mono()
    };
    let (device, driver) = ManualDevice::new();
    let (mut engine, seen) = collect_diagnostics(Engine::new(config, device).unwrap());
    engine
        .open_patch_source("node in adc~ 0\nnode out dac~ 0\nconnect in 0 out 0\n")
        .unwrap();
    engine.start().unwrap();

    let input = [f32::NAN, 0.5, f32::NEG_INFINITY, 0.25];
    let mut output = [9.0f32; 4];
    assert!(driver.tick_into(Some(&input), &mut output));
    assert_eq!(output, [0.0, 0.5, 0.0, 0.25]);
    engine.poll();
    assert_eq!(engine.stats().sanitized_blocks, 1);
    assert!(seen
        .lock()
        .unwrap()
        .contains(&Diagnostic::SamplesSanitized { blocks: 1 }));
}

/// Loses the scheduler on close, like a backend that cannot recover it.
struct LossyDevice(ManualDevice);

struct LossyStream(Box<dyn StreamHandle>);

impl StreamHandle for LossyStream {
    fn close(self: Box<Self>) -> Option<Scheduler> {
        drop(self.0.close());
        None
    }
}

impl AudioDevice for LossyDevice {
    fn name(&self) -> &str {
        "lossy"
    }

    fn open_stream(
        &mut self,
        config: &EngineConfig,
        scheduler: Scheduler,
    ) -> Result<Box<dyn StreamHandle>, OpenError> {
        let stream = self.0.open_stream(config, scheduler)?;
        Ok(Box::new(LossyStream(stream)))
    }
}

#[test]
fn lost_scheduler_is_rebuilt_with_current_patch() {
    let (device, driver) = ManualDevice::new();
    let (mut engine, seen) = collect_diagnostics(Engine::new(mono(), LossyDevice(device)).unwrap());
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();
    assert_eq!(driver.tick(), Some(vec![0.5; 4]));

    engine.stop();
    assert!(seen.lock().unwrap().contains(&Diagnostic::SchedulerRebuilt));
    engine.start().unwrap();
    assert_eq!(driver.tick(), Some(vec![0.5; 4]));
}

#[test]
fn null_device_runs_in_the_background() {
    let mut engine = Engine::new(mono(), NullDevice::unpaced()).unwrap();
    engine.open_patch_source(SIG).unwrap();
    engine.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.poll().swaps_applied == 0 || engine.stats().blocks_rendered < 10 {
        assert!(Instant::now() < deadline, "null device rendered nothing");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(engine.stop(), RunState::Stopped);
    let rendered = engine.stats().blocks_rendered;
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(engine.poll().blocks_rendered, rendered);

    engine.shutdown();
    assert_eq!(engine.state(), RunState::Disposed);
}

#[test]
fn default_engine_starts_and_shuts_down() {
    let mut engine = create_engine(EngineConfig::default()).unwrap();
    assert_eq!(engine.state(), RunState::Stopped);
    engine
        .open_patch_source("node o osc~ 440\nnode l dac~ 0\nnode r dac~ 1\nconnect o 0 l 0\nconnect o 0 r 0\n")
        .unwrap();
    if engine.start().is_ok() {
        assert_eq!(engine.state(), RunState::Running);
    }
    engine.shutdown();
    assert_eq!(engine.state(), RunState::Disposed);
    assert!(matches!(
        engine.open_patch_source(SIG),
        Err(EngineError::State {
            state: RunState::Disposed,
            ..
        })
    ));
}
