//! Open a patch on the default device and trigger it a few times.
//!
//! Plays through the system output when built with `--features cpal`;
//! otherwise a null device renders in the background.
//!
//! ```text
//! RUST_LOG=pdcore=debug cargo run --example play_patch --features cpal
//! ```

use pdcore::config::EngineConfig;
use pdcore::engine::{create_engine, Diagnostic};
use std::error::Error;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let patch = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/patches/pluck.patch".to_string());

    let mut engine = create_engine(EngineConfig::default())?.with_diagnostics(|d: &Diagnostic| {
        tracing::warn!(?d, "engine diagnostic");
    });
    engine.open_patch(&patch)?;
    engine.start()?;

    for step in 0..8 {
        engine.send_bang("play")?;
        engine.send_float("bright", 600.0 + 400.0 * step as f64)?;
        thread::sleep(Duration::from_millis(400));
    }

    engine.stop();
    let stats = engine.poll();
    tracing::info!(
        blocks = stats.blocks_rendered,
        messages = stats.messages_applied,
        unrouted = stats.messages_unrouted,
        "done"
    );
    engine.shutdown();
    Ok(())
}
