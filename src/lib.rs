//! pdcore: a real-time-safe audio engine with Pd-style patches.
//!
//! Patches are parsed into a [`graph::Graph`], compiled into an immutable
//! [`plan::Plan`], instantiated as an [`rt::Runtime`] on the control thread
//! and published to the audio callback through lock-free rings. The
//! [`engine::Engine`] facade ties this to an [`device::AudioDevice`].
//!
//! ```
//! use pdcore::harness::OfflineRenderer;
//! use pdcore::EngineConfig;
//!
//! let config = EngineConfig { channels_out: 1, ..EngineConfig::default() };
//! let mut renderer = OfflineRenderer::new(config).unwrap();
//! renderer.load("node s sig~ 0.25\nnode out dac~ 0\nconnect s 0 out 0").unwrap();
//! assert!(renderer.render(64).iter().all(|&s| s == 0.25));
//! ```

pub mod config;
pub mod control;
#[cfg(feature = "cpal")]
pub mod cpal_device;
pub mod device;
pub mod dsl;
pub mod engine;
pub mod graph;
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod node;
pub mod patch;
pub mod plan;
pub mod rt;
pub mod states;

/// Signal sample type used throughout the engine.
#[cfg(not(feature = "f64"))]
pub type Sample = f32;

/// Signal sample type used throughout the engine.
#[cfg(feature = "f64")]
pub type Sample = f64;

pub use config::{ConfigError, EngineConfig};
pub use control::{Message, Name, Payload};
pub use engine::{create_engine, Diagnostic, Engine, EngineError, EngineStats, RunState};
pub use graph::{Graph, NodeId};
pub use node::NodeKind;
pub use patch::{load, serialize, Patch};
