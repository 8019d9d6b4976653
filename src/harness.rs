//! Offline harness: drive a scheduler pair without a device, and store
//! renders as WAV files.

use crate::config::{ConfigError, EngineConfig};
use crate::control::Message;
use crate::graph::Graph;
use crate::patch::{self, LoadError, ValidationError};
use crate::plan::{Plan, PlanError};
use crate::rt::{scheduler_pair, Runtime, Scheduler, SchedulerHandle};
use crate::Sample;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use std::sync::Arc;

/// Renders blocks on the calling thread through the same command path a
/// device would use.
#[derive(Debug)]
pub struct OfflineRenderer {
    config: EngineConfig,
    handle: SchedulerHandle,
    scheduler: Scheduler,
    input: Vec<Sample>,
}

impl OfflineRenderer {
    /// Create a renderer for `config`.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (handle, scheduler) = scheduler_pair(&config);
        Ok(Self {
            input: vec![0.0; config.input_len()],
            config,
            handle,
            scheduler,
        })
    }

    /// Stream format.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile `graph` and bind it at the next block.
    pub fn bind(&mut self, graph: &Graph) -> Result<(), PlanError> {
        let plan = Arc::new(Plan::compile(graph, &self.config)?);
        // The plan was compiled against this renderer's config.
        let _ = self.handle.bind_graph(Runtime::new(plan));
        Ok(())
    }

    /// Load patch source and bind it at the next block.
    pub fn load(&mut self, source: &str) -> Result<(), LoadError> {
        let graph = patch::load(source)?;
        self.bind(&graph).map_err(ValidationError::Plan)?;
        Ok(())
    }

    /// Unbind at the next block.
    pub fn unbind(&mut self) {
        self.handle.unbind_graph();
    }

    /// Queue a message for the next block. Returns a message dropped on
    /// backlog overflow.
    pub fn send(&mut self, message: Message) -> Option<Message> {
        self.handle.deliver_message(message)
    }

    /// Control side of the scheduler pair.
    pub fn handle(&mut self) -> &mut SchedulerHandle {
        &mut self.handle
    }

    /// Input samples handed to every block (`block_size * channels_in`).
    pub fn input_mut(&mut self) -> &mut [Sample] {
        &mut self.input
    }

    /// Render one block into `output`.
    pub fn render_block_into(&mut self, output: &mut [Sample]) {
        self.handle.flush();
        let input = (self.config.channels_in > 0).then_some(&self.input[..]);
        self.scheduler.process_block(input, output);
    }

    /// Render `frames` frames, rounded up to whole blocks.
    pub fn render(&mut self, frames: usize) -> Vec<Sample> {
        let blocks = frames.div_ceil(self.config.block_size);
        let mut output = vec![0.0; blocks * self.config.output_len()];
        for block in output.chunks_exact_mut(self.config.output_len()) {
            self.render_block_into(block);
        }
        output
    }

    /// Drain RT signals emitted so far.
    pub fn signals(&mut self) -> Vec<u8> {
        self.handle.drain_signals()
    }
}

/// Sample encoding for [`write_wav`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavFormat {
    /// 16-bit integer PCM, clamped to `-1..=1`.
    Pcm16,
    /// 32-bit IEEE float.
    Float32,
}

/// Write interleaved samples as a WAV file.
pub fn write_wav<P: AsRef<Path>>(
    path: P,
    samples: &[Sample],
    config: &EngineConfig,
    format: WavFormat,
) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels: config.channels_out as u16,
        sample_rate: config.sample_rate,
        bits_per_sample: match format {
            WavFormat::Pcm16 => 16,
            WavFormat::Float32 => 32,
        },
        sample_format: match format {
            WavFormat::Pcm16 => SampleFormat::Int,
            WavFormat::Float32 => SampleFormat::Float,
        },
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        match format {
            WavFormat::Pcm16 => {
                let value = (sample as f32).clamp(-1.0, 1.0) * i16::MAX as f32;
                writer.write_sample(value as i16)?;
            }
            WavFormat::Float32 => writer.write_sample(sample as f32)?,
        }
    }
    writer.finalize()
}
