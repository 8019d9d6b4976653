//! RT module: real-time execution engine.
//!
//! A [`Runtime`] is a plan instantiated with node state, output slots and
//! feedback cells. The [`Scheduler`] owns the bound runtime inside the audio
//! context; the [`SchedulerHandle`] talks to it from the control context
//! through lock-free rings only.

// IMPORTANT: Do not call assert_invariant or any tracing in RT paths to avoid locks/allocs.

use crate::config::EngineConfig;
use crate::control::{Backlog, Command, Message, COMMAND_QUEUE_CAPACITY};
use crate::graph::NodeId;
use crate::invariant_ppt::{assert_invariant, RETIRED_OFF_RT};
use crate::invariant_rt::{
    drain_invariant_signals, new_invariant_queue, signal_invariant, INV_BLOCK_RENDERED,
    INV_GRAPH_SWAPPED, INV_GRAPH_UNBOUND, INV_MESSAGE_APPLIED, INV_MESSAGE_UNROUTED,
    INV_RETIRE_OVERFLOW, INV_SAMPLES_SANITIZED, INV_SILENCE_RENDERED,
};
use crate::node::MAX_INPUT_PORTS;
use crate::plan::{Plan, Source};
use crate::states::{FrameIo, NodeState};
use crate::Sample;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::sync::Arc;

/// Swaps that may be in flight before the handle holds further swaps back.
pub const RETIRE_QUEUE_CAPACITY: usize = 16;

/// The runtime engine: one instantiated plan.
#[derive(Debug, Clone)]
pub struct Runtime {
    plan: Arc<Plan>,
    states: Vec<NodeState>,
    slots: Vec<Sample>,
    cells: Vec<Sample>,
    sample_rate: f64,
}

impl Runtime {
    /// Instantiate a plan. Allocates; call from the control context.
    pub fn new(plan: Arc<Plan>) -> Self {
        let sample_rate = plan.config.sample_rate as f64;
        let states = plan
            .kinds
            .iter()
            .map(|kind| NodeState::init(kind, plan.config.sample_rate as f32))
            .collect();
        Self {
            states,
            slots: vec![0.0; plan.slot_count],
            cells: vec![0.0; plan.feedback_count()],
            sample_rate,
            plan,
        }
    }

    /// The plan this runtime executes.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Current state of a node.
    pub fn state(&self, node: NodeId) -> Option<&NodeState> {
        self.states.get(node.0)
    }

    /// Deliver a message to every receiver of its target.
    /// Returns `false` when the plan declares no such target.
    pub fn deliver(&mut self, message: &Message) -> bool {
        let plan = &*self.plan;
        let Some(target) = plan.targets.iter().find(|t| t.name == message.target) else {
            return false;
        };
        for &node in &plan.receivers[target.receivers.clone()] {
            self.states[node].apply(&message.payload, self.sample_rate);
        }
        true
    }

    /// Render interleaved frames into `output`, reading interleaved device
    /// input from `input` when present. Returns whether any non-finite value
    /// was replaced.
    pub fn process_block(&mut self, input: Option<&[Sample]>, output: &mut [Sample]) -> bool {
        let plan = &*self.plan;
        let channels_out = plan.config.channels_out.max(1);
        let channels_in = plan.config.channels_in;
        let sample_rate = self.sample_rate;
        let mut sanitized = false;

        output.fill(0.0);
        for (frame, out_frame) in output.chunks_exact_mut(channels_out).enumerate() {
            let in_frame: &[Sample] = match input {
                Some(buffer) if channels_in > 0 => buffer
                    .get(frame * channels_in..(frame + 1) * channels_in)
                    .unwrap_or(&[]),
                _ => &[],
            };
            let mut io = FrameIo {
                input: in_frame,
                output: out_frame,
                sanitized: false,
            };

            for step in &plan.steps {
                let ports = &plan.port_spans[step.ports.clone()];
                let mut inputs = [0.0 as Sample; MAX_INPUT_PORTS];
                for (value, span) in inputs.iter_mut().zip(ports) {
                    for source in &plan.sources[span.clone()] {
                        *value += match *source {
                            Source::Slot(slot) => self.slots[slot],
                            Source::Feedback(cell) => self.cells[cell],
                        };
                    }
                }
                self.states[step.node].tick(
                    &inputs[..ports.len().min(MAX_INPUT_PORTS)],
                    &mut self.slots[step.outputs.clone()],
                    &mut io,
                    sample_rate,
                );
            }
            sanitized |= io.sanitized;

            // Feedback edges see this frame's value on the next frame.
            for (cell, &slot) in self.cells.iter_mut().zip(&plan.feedback_sources) {
                let value = self.slots[slot];
                *cell = if value.is_finite() {
                    value
                } else {
                    sanitized = true;
                    0.0
                };
            }
        }
        sanitized
    }
}

/// Errors when publishing a runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
    /// The runtime was compiled for a different stream format.
    #[error("runtime compiled for {found:?}, scheduler runs {expected:?}")]
    ConfigMismatch {
        /// Scheduler format.
        expected: EngineConfig,
        /// Runtime format.
        found: EngineConfig,
    },
}

/// Audio-context half of the scheduler. Moved into the device callback.
pub struct Scheduler {
    config: EngineConfig,
    runtime: Option<Box<Runtime>>,
    commands: Consumer<Command>,
    retired: Producer<Option<Box<Runtime>>>,
    signals: Producer<u8>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("bound", &self.runtime.is_some())
            .finish()
    }
}

impl Scheduler {
    /// Stream format this scheduler renders.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a runtime is bound.
    pub fn is_bound(&self) -> bool {
        self.runtime.is_some()
    }

    /// Process one block. Buffers are interleaved; `output` is normally
    /// `block_size * channels_out` long. Extra samples are zeroed, and a
    /// short buffer renders as many whole frames as fit.
    pub fn process_block(&mut self, input: Option<&[Sample]>, output: &mut [Sample]) {
        self.apply_commands();

        let channels = self.config.channels_out.max(1);
        let len = (output.len() / channels * channels).min(self.config.output_len());
        let (block, rest) = output.split_at_mut(len);
        rest.fill(0.0);

        match self.runtime.as_mut() {
            Some(runtime) => {
                if runtime.process_block(input, block) {
                    signal_invariant(&mut self.signals, INV_SAMPLES_SANITIZED);
                }
            }
            None => {
                block.fill(0.0);
                signal_invariant(&mut self.signals, INV_SILENCE_RENDERED);
            }
        }
        signal_invariant(&mut self.signals, INV_BLOCK_RENDERED);
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                Command::Bind(runtime) => {
                    let old = self.runtime.replace(runtime);
                    self.retire(old);
                    signal_invariant(&mut self.signals, INV_GRAPH_SWAPPED);
                }
                Command::Unbind => {
                    let old = self.runtime.take();
                    self.retire(old);
                    signal_invariant(&mut self.signals, INV_GRAPH_UNBOUND);
                }
                Command::Message(message) => {
                    let routed = match self.runtime.as_mut() {
                        Some(runtime) => runtime.deliver(&message),
                        None => false,
                    };
                    let id = if routed {
                        INV_MESSAGE_APPLIED
                    } else {
                        INV_MESSAGE_UNROUTED
                    };
                    signal_invariant(&mut self.signals, id);
                }
            }
        }
    }

    fn retire(&mut self, runtime: Option<Box<Runtime>>) {
        // The handle never has more swaps in flight than the ring holds.
        if let Err(PushError::Full(runtime)) = self.retired.push(runtime) {
            signal_invariant(&mut self.signals, INV_RETIRE_OVERFLOW);
            drop(runtime);
        }
    }
}

/// Control-context half of the scheduler.
pub struct SchedulerHandle {
    config: EngineConfig,
    commands: Producer<Command>,
    retired: Consumer<Option<Box<Runtime>>>,
    signals: Consumer<u8>,
    backlog: Backlog,
    swaps_in_flight: usize,
    paused: bool,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("config", &self.config)
            .field("backlog", &self.backlog.len())
            .field("swaps_in_flight", &self.swaps_in_flight)
            .field("paused", &self.paused)
            .finish()
    }
}

/// Create a connected handle/scheduler pair for `config`.
pub fn scheduler_pair(config: &EngineConfig) -> (SchedulerHandle, Scheduler) {
    let (command_tx, command_rx) = RingBuffer::new(COMMAND_QUEUE_CAPACITY);
    let (retired_tx, retired_rx) = RingBuffer::new(RETIRE_QUEUE_CAPACITY);
    let (signal_tx, signal_rx) = new_invariant_queue();
    let handle = SchedulerHandle {
        config: *config,
        commands: command_tx,
        retired: retired_rx,
        signals: signal_rx,
        backlog: Backlog::new(config.message_capacity),
        swaps_in_flight: 0,
        paused: false,
    };
    let scheduler = Scheduler {
        config: *config,
        runtime: None,
        commands: command_rx,
        retired: retired_tx,
        signals: signal_tx,
    };
    (handle, scheduler)
}

impl SchedulerHandle {
    /// Stream format of the paired scheduler.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Install `runtime` at the next block boundary.
    pub fn bind_graph(&mut self, runtime: Runtime) -> Result<(), SwapError> {
        if runtime.plan().config != self.config {
            return Err(SwapError::ConfigMismatch {
                expected: self.config,
                found: runtime.plan().config,
            });
        }
        self.push_swap(Command::Bind(Box::new(runtime)));
        Ok(())
    }

    /// Remove the bound runtime at the next block boundary.
    pub fn unbind_graph(&mut self) {
        self.push_swap(Command::Unbind);
    }

    /// Queue a message for the start of the next block. Returns the message
    /// that was dropped to make room, if the backlog overflowed.
    pub fn deliver_message(&mut self, message: Message) -> Option<Message> {
        let dropped = self.backlog.push_message(message);
        self.flush();
        dropped
    }

    /// Hold all commands on the control side until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Let held commands through to the scheduler again.
    pub fn resume(&mut self) {
        self.paused = false;
        self.flush();
    }

    /// Whether commands are held back.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Commands waiting on the control side.
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// Messages waiting on the control side.
    pub fn pending_messages(&self) -> usize {
        self.backlog.message_count()
    }

    /// Move waiting commands into the command ring, in order, as far as it
    /// has room.
    pub fn flush(&mut self) {
        self.collect_garbage();
        if self.paused {
            return;
        }
        while let Some(command) = self.backlog.pop_front() {
            let swap = command.is_swap();
            if swap && self.swaps_in_flight >= RETIRE_QUEUE_CAPACITY {
                self.backlog.push_front(command);
                break;
            }
            match self.commands.push(command) {
                Ok(()) => {
                    if swap {
                        self.swaps_in_flight += 1;
                    }
                }
                Err(PushError::Full(command)) => {
                    tracing::trace!(command = command.description(), "command ring full, holding");
                    self.backlog.push_front(command);
                    break;
                }
            }
        }
    }

    /// Free runtimes the scheduler has retired. Returns how many were freed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut freed = 0;
        while let Ok(runtime) = self.retired.pop() {
            assert_invariant(
                RETIRED_OFF_RT,
                self.swaps_in_flight > 0,
                "every retirement answers a published swap",
                Some("SchedulerHandle::collect_garbage"),
            );
            self.swaps_in_flight -= 1;
            if runtime.is_some() {
                freed += 1;
            }
        }
        freed
    }

    /// Drain RT signals emitted since the last call.
    pub fn drain_signals(&mut self) -> Vec<u8> {
        drain_invariant_signals(&mut self.signals)
    }

    fn push_swap(&mut self, command: Command) {
        // A swap superseded while still on the control side is freed here.
        if let Some(superseded) = self.backlog.push_swap(command) {
            tracing::trace!(command = superseded.description(), "superseded before publication");
        }
        self.flush();
    }
}

/// Render a runtime offline into a new interleaved buffer of `frames` frames.
pub fn render_offline(runtime: &mut Runtime, frames: usize) -> Vec<Sample> {
    let channels = runtime.plan().config.channels_out;
    let block = runtime.plan().config.block_size * channels;
    let mut output = vec![0.0; frames * channels];
    for chunk in output.chunks_mut(block) {
        runtime.process_block(None, chunk);
    }
    output
}
