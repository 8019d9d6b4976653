//! Engine facade: device lifecycle, patch loading and message delivery.
//!
//! ```text
//! Stopped --start()--> Running --stop()--> Stopped
//!    |                    |
//!    +----shutdown()------+--> Disposed
//! ```
//!
//! Everything here runs in the control context. Patches are parsed,
//! compiled and instantiated on the calling thread; only the finished
//! runtime crosses into the audio context, through the scheduler's command
//! ring. While the engine is stopped, the scheduler sits idle inside the
//! engine and commands wait in the handle's backlog.

use crate::config::{ConfigError, EngineConfig};
use crate::control::{Message, Name, NameError, Payload};
use crate::device::{AudioDevice, DeviceError, StreamHandle};
use crate::invariant_ppt::{assert_invariant, SWAP_BUILT_OFF_RT};
use crate::invariant_rt::{
    count_invariant_signals, invariant_name, INV_BLOCK_RENDERED, INV_GRAPH_SWAPPED,
    INV_GRAPH_UNBOUND, INV_MESSAGE_APPLIED, INV_MESSAGE_UNROUTED, INV_RETIRE_OVERFLOW,
    INV_SAMPLES_SANITIZED, INV_SILENCE_RENDERED,
};
use crate::patch::{self, FsPatchReader, LoadError, ParseError, PatchReader, ValidationError};
use crate::plan::Plan;
use crate::rt::{scheduler_pair, Runtime, Scheduler, SchedulerHandle, SwapError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// No patch at the given path.
    #[error("patch not found: {}", .0.display())]
    NotFound(PathBuf),
    /// The patch could not be read.
    #[error("cannot read patch {}: {source}", .path.display())]
    Io {
        /// Requested path.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },
    /// Malformed patch source.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Structurally invalid patch.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The audio device failed; the engine stays stopped.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The runtime does not fit the scheduler.
    #[error(transparent)]
    Swap(#[from] SwapError),
    /// The operation is not valid in the current state.
    #[error("engine is {state:?}: cannot {operation}")]
    State {
        /// Current state.
        state: RunState,
        /// Refused operation.
        operation: &'static str,
    },
    /// Target or symbol cannot be carried by a message.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] NameError),
}

impl From<LoadError> for EngineError {
    fn from(error: LoadError) -> Self {
        match error {
            LoadError::Parse(e) => EngineError::Parse(e),
            LoadError::Validation(e) => EngineError::Validation(e),
        }
    }
}

/// Engine run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No stream is open; commands wait.
    Stopped,
    /// The device is calling the scheduler.
    Running,
    /// Shut down for good.
    Disposed,
}

/// Non-fatal events reported through the diagnostics callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The backlog overflowed and its oldest message was discarded.
    MessageDropped(Message),
    /// Messages reached a runtime that declares no such target.
    MessagesUnrouted {
        /// Messages since the last poll.
        count: usize,
    },
    /// Blocks in which non-finite samples were replaced with zero.
    SamplesSanitized {
        /// Blocks since the last poll.
        blocks: usize,
    },
    /// A retired runtime had to be freed in the audio context.
    RetiredOnAudioThread,
    /// The device lost the scheduler; a fresh one was built and the current
    /// patch rebound. Commands still in flight were lost.
    SchedulerRebuilt,
}

/// Callback for [`Diagnostic`]s.
pub type DiagnosticCallback = Box<dyn FnMut(&Diagnostic) + Send>;

/// Counters accumulated by [`Engine::poll`].
///
/// The audio context reports through a lossy ring of
/// [`INVARIANT_QUEUE_CAPACITY`](crate::invariant_rt::INVARIANT_QUEUE_CAPACITY)
/// ids. A host that goes longer than about a second between control calls
/// (at 48 kHz / 64 frames) undercounts, and the unrouted, sanitized and
/// retired-on-audio-thread diagnostics for the lost ids are never raised.
/// `messages_dropped` and `runtimes_freed` are counted on the control side
/// and stay exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Blocks rendered.
    pub blocks_rendered: u64,
    /// Blocks rendered with no patch bound.
    pub silent_blocks: u64,
    /// Patches installed by the scheduler.
    pub swaps_applied: u64,
    /// Unbinds applied by the scheduler.
    pub unbinds_applied: u64,
    /// Messages that reached a receiver.
    pub messages_applied: u64,
    /// Messages with no matching target.
    pub messages_unrouted: u64,
    /// Messages discarded by backlog overflow.
    pub messages_dropped: u64,
    /// Blocks containing sanitized samples.
    pub sanitized_blocks: u64,
    /// Runtimes freed on the control thread.
    pub runtimes_freed: u64,
}

/// The engine facade.
pub struct Engine {
    config: EngineConfig,
    device: Box<dyn AudioDevice>,
    reader: Box<dyn PatchReader>,
    handle: SchedulerHandle,
    idle: Option<Scheduler>,
    stream: Option<Box<dyn StreamHandle>>,
    current: Option<Arc<Plan>>,
    disposed: bool,
    stats: EngineStats,
    diagnostics: Option<DiagnosticCallback>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("device", &self.device.name())
            .field("state", &self.state())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Create an engine on the default device: the system output with feature
/// `cpal`, otherwise a [`NullDevice`](crate::device::NullDevice).
pub fn create_engine(config: EngineConfig) -> Result<Engine, EngineError> {
    #[cfg(feature = "cpal")]
    let device = crate::cpal_device::CpalDevice::new();
    #[cfg(not(feature = "cpal"))]
    let device = crate::device::NullDevice::new();
    Engine::new(config, device)
}

impl Engine {
    /// Create a stopped engine that will run on `device`.
    pub fn new(config: EngineConfig, device: impl AudioDevice + 'static) -> Result<Self, EngineError> {
        config.validate()?;
        let (mut handle, scheduler) = scheduler_pair(&config);
        handle.pause();
        tracing::info!(
            device = device.name(),
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            channels_in = config.channels_in,
            channels_out = config.channels_out,
            "engine created"
        );
        Ok(Self {
            config,
            device: Box::new(device),
            reader: Box::new(FsPatchReader),
            handle,
            idle: Some(scheduler),
            stream: None,
            current: None,
            disposed: false,
            stats: EngineStats::default(),
            diagnostics: None,
        })
    }

    /// Read patch paths through `reader` instead of the filesystem.
    pub fn with_reader(mut self, reader: impl PatchReader + 'static) -> Self {
        self.reader = Box::new(reader);
        self
    }

    /// Report [`Diagnostic`]s to `callback`.
    pub fn with_diagnostics(mut self, callback: impl FnMut(&Diagnostic) + Send + 'static) -> Self {
        self.diagnostics = Some(Box::new(callback));
        self
    }

    /// Stream format.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        if self.disposed {
            RunState::Disposed
        } else if self.stream.is_some() {
            RunState::Running
        } else {
            RunState::Stopped
        }
    }

    /// Whether a patch is open.
    pub fn has_patch(&self) -> bool {
        self.current.is_some()
    }

    /// Counters as of the last [`poll`](Self::poll).
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    fn ensure_live(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.disposed {
            return Err(EngineError::State {
                state: RunState::Disposed,
                operation,
            });
        }
        Ok(())
    }

    /// Open the device stream. Idempotent while running. A device failure
    /// leaves the engine stopped with its pending commands intact.
    pub fn start(&mut self) -> Result<RunState, EngineError> {
        self.ensure_live("start")?;
        if self.stream.is_some() {
            return Ok(RunState::Running);
        }
        let scheduler = match self.idle.take() {
            Some(scheduler) => scheduler,
            None => self.rebuild_scheduler(),
        };
        match self.device.open_stream(&self.config, scheduler) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.handle.resume();
                tracing::info!(device = self.device.name(), "engine started");
                self.poll();
                Ok(RunState::Running)
            }
            Err(open) => {
                tracing::error!(device = self.device.name(), error = %open.error, "device failed to open");
                self.idle = match open.scheduler {
                    Some(scheduler) => Some(scheduler),
                    None => Some(self.rebuild_scheduler()),
                };
                Err(open.error.into())
            }
        }
    }

    /// Close the device stream. Returns once the callback has stopped.
    /// Idempotent.
    pub fn stop(&mut self) -> RunState {
        let Some(stream) = self.stream.take() else {
            return self.state();
        };
        self.handle.pause();
        self.idle = match stream.close() {
            Some(scheduler) => Some(scheduler),
            None => Some(self.rebuild_scheduler()),
        };
        self.poll();
        tracing::info!(blocks = self.stats.blocks_rendered, "engine stopped");
        RunState::Stopped
    }

    /// Load the patch at `path` through the engine's reader and bind it.
    pub fn open_patch(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        self.ensure_live("open a patch")?;
        let path = path.as_ref();
        let source = self.reader.read(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                EngineError::NotFound(path.to_path_buf())
            } else {
                EngineError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        self.open_patch_source(&source)?;
        tracing::info!(path = %path.display(), "patch opened");
        Ok(())
    }

    /// Load patch source and bind it. While running, the new patch replaces
    /// the old one at the next block boundary.
    pub fn open_patch_source(&mut self, source: &str) -> Result<(), EngineError> {
        self.ensure_live("open a patch")?;
        let graph = patch::load(source)?;
        let plan = Plan::compile(&graph, &self.config).map_err(ValidationError::Plan)?;
        let plan = Arc::new(plan);
        let runtime = Runtime::new(Arc::clone(&plan));
        assert_invariant(
            SWAP_BUILT_OFF_RT,
            runtime.plan().config == self.config,
            "runtime instantiated on the control thread for the engine's format",
            Some("Engine::open_patch_source"),
        );
        self.handle.bind_graph(runtime)?;
        self.current = Some(plan);
        self.poll();
        Ok(())
    }

    /// Unbind the current patch; blocks render silence. Safe to repeat and
    /// to call after shutdown.
    pub fn close_patch(&mut self) {
        if self.disposed || self.current.is_none() {
            return;
        }
        self.handle.unbind_graph();
        self.current = None;
        self.poll();
        tracing::info!("patch closed");
    }

    /// Queue `payload` for `target`. Applied at the next block while
    /// running, or after the next start while stopped.
    pub fn send_message(&mut self, target: &str, payload: Payload) -> Result<(), EngineError> {
        self.ensure_live("send a message")?;
        let message = Message::new(target, payload)?;
        if let Some(dropped) = self.handle.deliver_message(message) {
            self.stats.messages_dropped += 1;
            tracing::warn!(target = %dropped.target, "message backlog full, dropped oldest message");
            self.report(Diagnostic::MessageDropped(dropped));
        }
        self.poll();
        Ok(())
    }

    /// Send `bang` to `target`.
    pub fn send_bang(&mut self, target: &str) -> Result<(), EngineError> {
        self.send_message(target, Payload::Bang)
    }

    /// Send a float to `target`.
    pub fn send_float(&mut self, target: &str, value: f64) -> Result<(), EngineError> {
        self.send_message(target, Payload::Float(value))
    }

    /// Send a symbol to `target`.
    pub fn send_symbol(&mut self, target: &str, symbol: &str) -> Result<(), EngineError> {
        let symbol = Name::new(symbol)?;
        self.send_message(target, Payload::Symbol(symbol))
    }

    /// Stop, close the patch and release everything. Later operations fail
    /// with [`EngineError::State`], except the idempotent ones.
    pub fn shutdown(&mut self) {
        if self.disposed {
            return;
        }
        self.stop();
        self.close_patch();
        // The idle scheduler owns the last runtime; dropping it here frees
        // it on the control thread.
        self.idle = None;
        self.stats.runtimes_freed += self.handle.collect_garbage() as u64;
        self.disposed = true;
        tracing::info!(stats = ?self.stats, "engine shut down");
    }

    /// Drain audio-context signals and retired runtimes, push waiting
    /// commands, and update statistics. Every control operation polls.
    ///
    /// Call this at least every few hundred milliseconds while the stream
    /// runs: the signal ring holds 1024 ids and drops the rest, so the
    /// counts in [`EngineStats`] are exact only when polled in time.
    pub fn poll(&mut self) -> &EngineStats {
        self.stats.runtimes_freed += self.handle.collect_garbage() as u64;
        self.handle.flush();

        let signals = self.handle.drain_signals();
        if signals.is_empty() {
            return &self.stats;
        }
        let counts = count_invariant_signals(&signals);
        let count = |id: u8| counts[id as usize];
        self.stats.blocks_rendered += count(INV_BLOCK_RENDERED) as u64;
        self.stats.silent_blocks += count(INV_SILENCE_RENDERED) as u64;
        self.stats.swaps_applied += count(INV_GRAPH_SWAPPED) as u64;
        self.stats.unbinds_applied += count(INV_GRAPH_UNBOUND) as u64;
        self.stats.messages_applied += count(INV_MESSAGE_APPLIED) as u64;
        self.stats.messages_unrouted += count(INV_MESSAGE_UNROUTED) as u64;
        self.stats.sanitized_blocks += count(INV_SAMPLES_SANITIZED) as u64;

        if count(INV_MESSAGE_UNROUTED) > 0 {
            self.report(Diagnostic::MessagesUnrouted {
                count: count(INV_MESSAGE_UNROUTED),
            });
        }
        if count(INV_SAMPLES_SANITIZED) > 0 {
            self.report(Diagnostic::SamplesSanitized {
                blocks: count(INV_SAMPLES_SANITIZED),
            });
        }
        for _ in 0..count(INV_RETIRE_OVERFLOW) {
            tracing::warn!("runtime freed in the audio context");
            self.report(Diagnostic::RetiredOnAudioThread);
        }
        tracing::debug!(
            signals = signals.len(),
            first = invariant_name(signals[0]),
            blocks = self.stats.blocks_rendered,
            "drained audio signals"
        );
        &self.stats
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        if let Some(callback) = self.diagnostics.as_mut() {
            callback(&diagnostic);
        }
    }

    /// Replace a scheduler the device failed to hand back. The current patch
    /// is re-instantiated for the new scheduler.
    fn rebuild_scheduler(&mut self) -> Scheduler {
        tracing::warn!(
            pending = self.handle.pending(),
            "device did not return the scheduler, rebuilding"
        );
        let (mut handle, scheduler) = scheduler_pair(&self.config);
        handle.pause();
        if let Some(plan) = &self.current {
            // Same config by construction.
            let _ = handle.bind_graph(Runtime::new(Arc::clone(plan)));
        }
        self.handle = handle;
        self.report(Diagnostic::SchedulerRebuilt);
        scheduler
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ManualDevice;

    const SIG: &str = "node s sig~ 0.5\nnode out dac~ 0\nconnect s 0 out 0\nreceive level s\n";

    fn mono() -> EngineConfig {
        EngineConfig {
            channels_out: 1,
            block_size: 4,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn lifecycle_is_idempotent() {
        let (device, driver) = ManualDevice::new();
        let mut engine = Engine::new(mono(), device).unwrap();
        assert_eq!(engine.state(), RunState::Stopped);
        assert_eq!(engine.stop(), RunState::Stopped);
        assert_eq!(engine.start().unwrap(), RunState::Running);
        assert_eq!(engine.start().unwrap(), RunState::Running);
        assert_eq!(driver.opens(), 1);
        assert_eq!(engine.stop(), RunState::Stopped);
        assert_eq!(engine.stop(), RunState::Stopped);
        assert!(!driver.is_open());
    }

    #[test]
    fn patch_opened_while_stopped_binds_on_start() {
        let (device, driver) = ManualDevice::new();
        let mut engine = Engine::new(mono(), device).unwrap();
        engine.open_patch_source(SIG).unwrap();
        engine.send_float("level", 0.25).unwrap();
        engine.start().unwrap();
        assert_eq!(driver.tick(), Some(vec![0.25; 4]));
        engine.poll();
        assert_eq!(engine.stats().swaps_applied, 1);
        assert_eq!(engine.stats().messages_applied, 1);
    }

    #[test]
    fn device_failure_keeps_engine_stopped() {
        let (device, driver) = ManualDevice::new();
        let mut engine = Engine::new(mono(), device).unwrap();
        engine.open_patch_source(SIG).unwrap();
        driver.fail_next_open(DeviceError::NoDevice);
        assert!(matches!(
            engine.start(),
            Err(EngineError::Device(DeviceError::NoDevice))
        ));
        assert_eq!(engine.state(), RunState::Stopped);
        engine.start().unwrap();
        assert_eq!(driver.tick(), Some(vec![0.5; 4]));
    }

    #[test]
    fn shutdown_refuses_further_work() {
        let (device, _driver) = ManualDevice::new();
        let mut engine = Engine::new(mono(), device).unwrap();
        engine.shutdown();
        engine.shutdown();
        engine.close_patch();
        assert_eq!(engine.stop(), RunState::Disposed);
        assert!(matches!(
            engine.start(),
            Err(EngineError::State {
                state: RunState::Disposed,
                ..
            })
        ));
        assert!(engine.send_bang("x").is_err());
        assert!(engine.open_patch_source(SIG).is_err());
    }

    #[test]
    fn bad_names_are_invalid_messages() {
        let (device, _driver) = ManualDevice::new();
        let mut engine = Engine::new(mono(), device).unwrap();
        assert!(matches!(
            engine.send_symbol("level", "two words"),
            Err(EngineError::InvalidMessage(NameError::Whitespace(_)))
        ));
        assert!(matches!(
            engine.send_bang(""),
            Err(EngineError::InvalidMessage(NameError::Empty))
        ));
    }
}
