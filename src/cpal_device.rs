//! cpal output backend.
//!
//! cpal hands the callback buffers of whatever size the platform chooses;
//! [`CpalDevice`] re-blocks them into fixed engine blocks so the scheduler
//! always sees `block_size` frames. Device input is not captured; `adc~`
//! nodes read silence.

use crate::config::EngineConfig;
use crate::device::{AudioDevice, DeviceError, OpenError, StreamHandle};
use crate::rt::Scheduler;
use crate::Sample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc;
use std::time::Duration;

/// How long `close` waits for cpal to release the callback.
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// The platform's default audio host.
pub struct CpalDevice {
    host: cpal::Host,
    device_name: Option<String>,
}

impl CpalDevice {
    /// Use the default output device of the default host.
    pub fn new() -> Self {
        let host = cpal::default_host();
        tracing::info!(host = host.id().name(), "cpal backend initialized");
        Self {
            host,
            device_name: None,
        }
    }

    /// Use the first output device whose name contains `name`.
    pub fn with_device(name: &str) -> Self {
        Self {
            device_name: Some(name.to_lowercase()),
            ..Self::new()
        }
    }

    fn find_output_device(&self) -> Result<cpal::Device, DeviceError> {
        match &self.device_name {
            Some(search) => {
                let devices = self
                    .host
                    .output_devices()
                    .map_err(|e| DeviceError::Backend(e.to_string()))?;
                for device in devices {
                    if let Ok(name) = device.name() {
                        if name.to_lowercase().contains(search.as_str()) {
                            return Ok(device);
                        }
                    }
                }
                Err(DeviceError::NoDevice)
            }
            None => self.host.default_output_device().ok_or(DeviceError::NoDevice),
        }
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the cpal callback. Sends the scheduler back when cpal
/// drops the callback.
struct Reblocker {
    scheduler: Option<Scheduler>,
    block: Vec<Sample>,
    pos: usize,
    returned: mpsc::SyncSender<Scheduler>,
}

impl Reblocker {
    fn fill(&mut self, data: &mut [f32]) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            data.fill(0.0);
            return;
        };
        for sample in data.iter_mut() {
            if self.pos == self.block.len() {
                scheduler.process_block(None, &mut self.block);
                self.pos = 0;
            }
            *sample = self.block[self.pos] as f32;
            self.pos += 1;
        }
    }
}

impl Drop for Reblocker {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            let _ = self.returned.try_send(scheduler);
        }
    }
}

struct CpalStream {
    stream: Option<cpal::Stream>,
    returned: mpsc::Receiver<Scheduler>,
}

impl StreamHandle for CpalStream {
    fn close(mut self: Box<Self>) -> Option<Scheduler> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
        }
        let scheduler = self.returned.recv_timeout(RELEASE_TIMEOUT).ok();
        tracing::info!(recovered = scheduler.is_some(), "cpal stream closed");
        scheduler
    }
}

fn build_error(error: cpal::BuildStreamError) -> DeviceError {
    match error {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NoDevice,
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::UnsupportedConfig("rejected by the output device".into())
        }
        other => DeviceError::Backend(other.to_string()),
    }
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open_stream(
        &mut self,
        config: &EngineConfig,
        scheduler: Scheduler,
    ) -> Result<Box<dyn StreamHandle>, OpenError> {
        let device = match self.find_output_device() {
            Ok(device) => device,
            Err(error) => {
                return Err(OpenError {
                    error,
                    scheduler: Some(scheduler),
                })
            }
        };

        let stream_config = cpal::StreamConfig {
            channels: config.channels_out as u16,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (returned_tx, returned_rx) = mpsc::sync_channel(1);
        let mut reblocker = Reblocker {
            scheduler: Some(scheduler),
            block: vec![0.0; config.output_len()],
            pos: config.output_len(),
            returned: returned_tx,
        };

        let built = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| reblocker.fill(data),
            |err| tracing::error!(%err, "cpal stream error"),
            None,
        );
        let fail = |error| OpenError {
            error,
            scheduler: returned_rx.try_recv().ok(),
        };
        let stream = match built {
            Ok(stream) => stream,
            Err(e) => return Err(fail(build_error(e))),
        };
        if let Err(e) = stream.play() {
            drop(stream);
            return Err(fail(DeviceError::Backend(e.to_string())));
        }

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            channels = config.channels_out,
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "output stream started"
        );
        Ok(Box::new(CpalStream {
            stream: Some(stream),
            returned: returned_rx,
        }))
    }
}
