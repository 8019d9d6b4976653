//! Swap patches on a running engine and watch the scheduler counters.

use pdcore::config::EngineConfig;
use pdcore::engine::create_engine;
use std::error::Error;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SINE: &str = include_str!("patches/sine.patch");
const DRONE: &str = include_str!("patches/drone.patch");

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut engine = create_engine(EngineConfig::default())?;
    engine.start()?;

    for round in 0..6 {
        let (name, source) = if round % 2 == 0 {
            ("sine", SINE)
        } else {
            ("drone", DRONE)
        };
        engine.open_patch_source(source)?;
        if name == "sine" {
            engine.send_float("freq", 220.0 * (round + 1) as f64)?;
        } else {
            engine.send_float("root", 55.0 * (round + 1) as f64)?;
        }
        thread::sleep(Duration::from_millis(500));

        let stats = engine.poll();
        tracing::info!(
            patch = name,
            swaps = stats.swaps_applied,
            freed = stats.runtimes_freed,
            blocks = stats.blocks_rendered,
            "swapped"
        );
    }

    engine.close_patch();
    thread::sleep(Duration::from_millis(100));
    tracing::info!(silent = engine.poll().silent_blocks, "patch closed");
    engine.shutdown();
    Ok(())
}
