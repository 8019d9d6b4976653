//! Render a patch to a WAV file without an audio device.
//!
//! ```text
//! cargo run --example offline_render -- demos/patches/pluck.patch pluck.wav
//! ```

use pdcore::config::EngineConfig;
use pdcore::harness::{write_wav, OfflineRenderer, WavFormat};
use pdcore::Message;
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let patch = args
        .next()
        .unwrap_or_else(|| "demos/patches/pluck.patch".to_string());
    let wav = args.next().unwrap_or_else(|| "pluck.wav".to_string());

    let config = EngineConfig::default();
    let mut renderer = OfflineRenderer::new(config)?;
    renderer.load(&std::fs::read_to_string(&patch)?)?;

    // Four plucks, half a second apart, each a little quieter.
    let half_second = config.sample_rate as usize / 2;
    let mut samples = Vec::new();
    for level in [1.0, 0.7, 0.5, 0.35] {
        renderer.send(Message::float("play", level)?);
        samples.extend(renderer.render(half_second));
    }

    write_wav(&wav, &samples, &config, WavFormat::Pcm16)?;
    tracing::info!(
        patch = %patch,
        wav = %wav,
        frames = samples.len() / config.channels_out,
        "rendered"
    );
    Ok(())
}
