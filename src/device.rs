//! Audio device abstraction consumed by the engine.
//!
//! A device takes ownership of a [`Scheduler`] when a stream opens and calls
//! [`Scheduler::process_block`] once per block from its callback. Closing the
//! stream hands the scheduler back once the callback can no longer run, so
//! the engine can keep it across stop/start cycles.
//!
//! - [`NullDevice`]: a paced background thread that discards output.
//! - [`ManualDevice`]: host-driven callback for tests and offline hosts.
//! - `CpalDevice` (feature `cpal`): the system's default output device.

use crate::config::EngineConfig;
use crate::rt::Scheduler;
use crate::Sample;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

/// Errors from the device layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No usable device is present.
    #[error("no audio device available")]
    NoDevice,
    /// The device cannot run the requested stream format.
    #[error("unsupported stream configuration: {0}")]
    UnsupportedConfig(String),
    /// The backend failed to build or start the stream.
    #[error("audio backend error: {0}")]
    Backend(String),
}

/// A failed open. The scheduler is handed back untouched.
#[derive(Debug)]
pub struct OpenError {
    /// Why the stream did not open.
    pub error: DeviceError,
    /// The scheduler passed to `open_stream`, when the backend could keep it.
    pub scheduler: Option<Scheduler>,
}

/// Something that can run a scheduler periodically.
pub trait AudioDevice {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Start calling `scheduler` once per block.
    fn open_stream(
        &mut self,
        config: &EngineConfig,
        scheduler: Scheduler,
    ) -> Result<Box<dyn StreamHandle>, OpenError>;
}

/// A running stream. Dropping it stops the stream as well.
pub trait StreamHandle {
    /// Stop the stream. Returns once the callback can no longer run, with the
    /// scheduler if the backend could recover it.
    fn close(self: Box<Self>) -> Option<Scheduler>;
}

// ============================================================================
// NullDevice
// ============================================================================

/// Runs the scheduler on a background thread at the nominal block rate and
/// discards the output.
#[derive(Debug, Clone, Default)]
pub struct NullDevice {
    unpaced: bool,
}

impl NullDevice {
    /// Paced at one block per block duration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render as fast as possible (load tests).
    pub fn unpaced() -> Self {
        Self { unpaced: true }
    }
}

struct NullStream {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Option<Scheduler>>>,
}

impl NullStream {
    fn join(&mut self) -> Option<Scheduler> {
        self.running.store(false, Ordering::Release);
        self.thread.take()?.join().ok().flatten()
    }
}

impl StreamHandle for NullStream {
    fn close(mut self: Box<Self>) -> Option<Scheduler> {
        self.join()
    }
}

impl Drop for NullStream {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

impl AudioDevice for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn open_stream(
        &mut self,
        config: &EngineConfig,
        scheduler: Scheduler,
    ) -> Result<Box<dyn StreamHandle>, OpenError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        // Parked here so a failed spawn can hand the scheduler back.
        let slot = Arc::new(Mutex::new(Some(scheduler)));
        let thread_slot = Arc::clone(&slot);
        let period = config.block_duration();
        let unpaced = self.unpaced;
        let input = vec![0.0 as Sample; config.input_len()];
        let mut output = vec![0.0 as Sample; config.output_len()];
        let has_input = config.channels_in > 0;

        let thread = std::thread::Builder::new()
            .name("pdcore-null-audio".into())
            .spawn(move || {
                let mut scheduler = take(&thread_slot)?;
                let mut deadline = Instant::now();
                while flag.load(Ordering::Acquire) {
                    let input = if has_input { Some(&input[..]) } else { None };
                    scheduler.process_block(input, &mut output);
                    if !unpaced {
                        deadline += period;
                        let now = Instant::now();
                        if deadline > now {
                            std::thread::sleep(deadline - now);
                        } else {
                            deadline = now;
                        }
                    }
                }
                Some(scheduler)
            });

        match thread {
            Ok(thread) => {
                tracing::info!(device = "null", ?period, "stream opened");
                Ok(Box::new(NullStream {
                    running,
                    thread: Some(thread),
                }))
            }
            Err(e) => Err(OpenError {
                error: DeviceError::Backend(e.to_string()),
                scheduler: take(&slot),
            }),
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

// ============================================================================
// ManualDevice
// ============================================================================

#[derive(Default)]
struct ManualShared {
    scheduler: Option<Scheduler>,
    fail_next: Option<DeviceError>,
}

/// Device whose callback runs when the host calls [`ManualDriver::tick`].
#[derive(Clone)]
pub struct ManualDevice {
    shared: Arc<Mutex<ManualShared>>,
    opens: Arc<AtomicUsize>,
}

/// Host side of a [`ManualDevice`]. Cloneable and usable from any thread.
#[derive(Clone)]
pub struct ManualDriver {
    shared: Arc<Mutex<ManualShared>>,
    opens: Arc<AtomicUsize>,
}

impl ManualDevice {
    /// Create a device and the driver that ticks it.
    pub fn new() -> (ManualDevice, ManualDriver) {
        let shared = Arc::new(Mutex::new(ManualShared::default()));
        let opens = Arc::new(AtomicUsize::new(0));
        let device = ManualDevice {
            shared: Arc::clone(&shared),
            opens: Arc::clone(&opens),
        };
        let driver = ManualDriver { shared, opens };
        (device, driver)
    }
}

fn lock(shared: &Mutex<ManualShared>) -> MutexGuard<'_, ManualShared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

struct ManualStream {
    shared: Arc<Mutex<ManualShared>>,
}

impl StreamHandle for ManualStream {
    fn close(self: Box<Self>) -> Option<Scheduler> {
        // Waits for an in-flight tick, which holds the lock.
        lock(&self.shared).scheduler.take()
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        lock(&self.shared).scheduler.take();
    }
}

impl AudioDevice for ManualDevice {
    fn name(&self) -> &str {
        "manual"
    }

    fn open_stream(
        &mut self,
        _config: &EngineConfig,
        scheduler: Scheduler,
    ) -> Result<Box<dyn StreamHandle>, OpenError> {
        let mut shared = lock(&self.shared);
        if let Some(error) = shared.fail_next.take() {
            return Err(OpenError {
                error,
                scheduler: Some(scheduler),
            });
        }
        shared.scheduler = Some(scheduler);
        self.opens.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ManualStream {
            shared: Arc::clone(&self.shared),
        }))
    }
}

impl ManualDriver {
    /// Make the next `open_stream` fail with `error`.
    pub fn fail_next_open(&self, error: DeviceError) {
        lock(&self.shared).fail_next = Some(error);
    }

    /// Whether a stream is open.
    pub fn is_open(&self) -> bool {
        lock(&self.shared).scheduler.is_some()
    }

    /// Streams opened so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    /// Run one callback into `output`. Returns `false`, leaving `output`
    /// untouched, when no stream is open.
    pub fn tick_into(&self, input: Option<&[Sample]>, output: &mut [Sample]) -> bool {
        let mut shared = lock(&self.shared);
        match shared.scheduler.as_mut() {
            Some(scheduler) => {
                scheduler.process_block(input, output);
                true
            }
            None => false,
        }
    }

    /// Run one callback and return the rendered block, or `None` when no
    /// stream is open.
    pub fn tick(&self) -> Option<Vec<Sample>> {
        let mut shared = lock(&self.shared);
        let scheduler = shared.scheduler.as_mut()?;
        let config = *scheduler.config();
        let input = vec![0.0 as Sample; config.input_len()];
        let mut output = vec![0.0 as Sample; config.output_len()];
        let input = (config.channels_in > 0).then_some(&input[..]);
        scheduler.process_block(input, &mut output);
        Some(output)
    }
}
