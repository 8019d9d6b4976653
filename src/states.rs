//! Node state definitions and the per-kind processing table for the RT engine.

// IMPORTANT: Do not call assert_invariant or any tracing in RT paths to avoid locks/allocs.

use crate::control::Payload;
use crate::node::NodeKind;
use crate::Sample;

const TAU: f64 = std::f64::consts::TAU;

/// Per-frame device I/O visible to `adc~` and `dac~`.
pub(crate) struct FrameIo<'a> {
    /// Input frame (empty when the stream has no input).
    pub(crate) input: &'a [Sample],
    /// Output frame, zeroed before the first node runs.
    pub(crate) output: &'a mut [Sample],
    /// Set when a non-finite value was replaced.
    pub(crate) sanitized: bool,
}

/// Envelope segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStage {
    /// Output at rest.
    Idle,
    /// Rising towards the peak.
    Attack,
    /// Falling back to zero.
    Decay,
}

/// Node states for mutable data. Runtime-adjustable parameters live here,
/// not in the plan, so messages never touch shared data.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Sine oscillator.
    Osc {
        /// Phase in cycles, `0..1`.
        phase: f64,
        /// Frequency in Hz.
        freq: f64,
    },
    /// Sawtooth ramp.
    Phasor {
        /// Phase in cycles, `0..1`.
        phase: f64,
        /// Frequency in Hz.
        freq: f64,
    },
    /// xorshift32 noise generator.
    Noise {
        /// Generator state, never zero.
        state: u32,
    },
    /// Gain node.
    Gain {
        /// Current factor.
        gain: Sample,
        /// Forced silence.
        muted: bool,
    },
    /// Multiply node (stateless).
    Multiply,
    /// Mixer node (stateless).
    Mixer,
    /// One-pole lowpass.
    Lowpass {
        /// Smoothing coefficient derived from the cutoff.
        coeff: Sample,
        /// Filter memory.
        z1: Sample,
    },
    /// Attack/decay envelope.
    Envelope {
        /// Current stage.
        stage: EnvStage,
        /// Current output.
        level: Sample,
        /// Level reached at the end of the attack.
        peak: Sample,
        /// Attack length in samples.
        attack: Sample,
        /// Decay length in samples.
        decay: Sample,
    },
    /// Control-driven constant.
    Sig {
        /// Current output.
        value: Sample,
    },
    /// Input channel tap.
    Adc {
        /// Channel index.
        channel: usize,
    },
    /// Output channel sink.
    Dac {
        /// Channel index.
        channel: usize,
    },
    /// Passthrough (stateless).
    Through,
}

impl NodeState {
    /// Initial state for a node of `kind`.
    pub fn init(kind: &NodeKind, sample_rate: f32) -> Self {
        let ms_to_samples = |ms: f32| (ms as Sample) * (sample_rate as Sample) / 1000.0;
        match *kind {
            NodeKind::Osc { freq } => NodeState::Osc {
                phase: 0.0,
                freq: freq as f64,
            },
            NodeKind::Phasor { freq } => NodeState::Phasor {
                phase: 0.0,
                freq: freq as f64,
            },
            NodeKind::Noise { seed } => NodeState::Noise {
                state: seed.max(1),
            },
            NodeKind::Gain { gain } => NodeState::Gain {
                gain: gain as Sample,
                muted: false,
            },
            NodeKind::Multiply => NodeState::Multiply,
            NodeKind::Mixer { .. } => NodeState::Mixer,
            NodeKind::Lowpass { cutoff } => NodeState::Lowpass {
                coeff: lowpass_coeff(cutoff as f64, sample_rate as f64),
                z1: 0.0,
            },
            NodeKind::Envelope {
                attack_ms,
                decay_ms,
            } => NodeState::Envelope {
                stage: EnvStage::Idle,
                level: 0.0,
                peak: 1.0,
                attack: ms_to_samples(attack_ms),
                decay: ms_to_samples(decay_ms),
            },
            NodeKind::Sig { value } => NodeState::Sig {
                value: value as Sample,
            },
            NodeKind::Adc { channel } => NodeState::Adc { channel },
            NodeKind::Dac { channel } => NodeState::Dac { channel },
            NodeKind::Through => NodeState::Through,
        }
    }

    /// Compute one frame. `inputs` holds the summed value of each input port.
    #[inline]
    pub(crate) fn tick(
        &mut self,
        inputs: &[Sample],
        outputs: &mut [Sample],
        io: &mut FrameIo<'_>,
        sample_rate: f64,
    ) {
        let input = |i: usize| inputs.get(i).copied().unwrap_or(0.0);
        let out = match self {
            NodeState::Osc { phase, freq } => {
                let value = (*phase * TAU).sin() as Sample;
                *phase = advance_phase(*phase, *freq + input(0) as f64, sample_rate);
                value
            }
            NodeState::Phasor { phase, freq } => {
                let value = *phase as Sample;
                *phase = advance_phase(*phase, *freq + input(0) as f64, sample_rate);
                value
            }
            NodeState::Noise { state } => {
                let mut x = *state;
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                *state = x;
                ((x as f64 / u32::MAX as f64) * 2.0 - 1.0) as Sample
            }
            NodeState::Gain { gain, muted } => {
                if *muted {
                    0.0
                } else {
                    input(0) * *gain
                }
            }
            NodeState::Multiply => input(0) * input(1),
            NodeState::Mixer => inputs.iter().sum(),
            NodeState::Lowpass { coeff, z1 } => {
                *z1 += *coeff * (input(0) - *z1);
                if !z1.is_finite() {
                    *z1 = 0.0;
                    io.sanitized = true;
                }
                *z1
            }
            NodeState::Envelope {
                stage,
                level,
                peak,
                attack,
                decay,
            } => {
                match stage {
                    EnvStage::Idle => {}
                    EnvStage::Attack => {
                        if *attack < 1.0 {
                            *level = *peak;
                        } else {
                            *level += *peak / *attack;
                        }
                        if *level >= *peak {
                            *level = *peak;
                            *stage = EnvStage::Decay;
                        }
                    }
                    EnvStage::Decay => {
                        if *decay < 1.0 {
                            *level = 0.0;
                        } else {
                            *level -= *peak / *decay;
                        }
                        if *level <= 0.0 {
                            *level = 0.0;
                            *stage = EnvStage::Idle;
                        }
                    }
                }
                *level
            }
            NodeState::Sig { value } => *value,
            NodeState::Adc { channel } => io.input.get(*channel).copied().unwrap_or(0.0),
            NodeState::Dac { channel } => {
                let mut value = input(0);
                if !value.is_finite() {
                    value = 0.0;
                    io.sanitized = true;
                }
                if let Some(slot) = io.output.get_mut(*channel) {
                    *slot += value;
                }
                return;
            }
            NodeState::Through => input(0),
        };
        if let Some(slot) = outputs.first_mut() {
            *slot = out;
        }
    }

    /// Apply a control message. Returns whether this node kind reacts to it.
    pub fn apply(&mut self, payload: &Payload, sample_rate: f64) -> bool {
        match (self, payload) {
            (NodeState::Osc { freq, .. } | NodeState::Phasor { freq, .. }, Payload::Float(v)) => {
                *freq = finite_or(*v, *freq);
                true
            }
            (NodeState::Osc { phase, .. } | NodeState::Phasor { phase, .. }, Payload::Bang) => {
                *phase = 0.0;
                true
            }
            (NodeState::Noise { state }, Payload::Float(v)) => {
                *state = (v.abs() as u32).max(1);
                true
            }
            (NodeState::Gain { gain, .. }, Payload::Float(v)) => {
                *gain = finite_or(*v, *gain as f64) as Sample;
                true
            }
            (NodeState::Gain { muted, .. }, Payload::Symbol(s)) => match s.as_str() {
                "mute" => {
                    *muted = true;
                    true
                }
                "unmute" => {
                    *muted = false;
                    true
                }
                _ => false,
            },
            (NodeState::Lowpass { coeff, .. }, Payload::Float(v)) if v.is_finite() => {
                *coeff = lowpass_coeff(v.max(0.0), sample_rate);
                true
            }
            (NodeState::Envelope { stage, peak, .. }, Payload::Bang) => {
                *peak = 1.0;
                *stage = EnvStage::Attack;
                true
            }
            (NodeState::Envelope { stage, peak, .. }, Payload::Float(v)) if v.is_finite() => {
                *peak = v.abs() as Sample;
                *stage = if *peak > 0.0 {
                    EnvStage::Attack
                } else {
                    EnvStage::Decay
                };
                true
            }
            (NodeState::Sig { value }, Payload::Float(v)) => {
                *value = finite_or(*v, *value as f64) as Sample;
                true
            }
            _ => false,
        }
    }
}

#[inline]
fn advance_phase(phase: f64, freq: f64, sample_rate: f64) -> f64 {
    let next = phase + freq / sample_rate;
    if next.is_finite() {
        next - next.floor()
    } else {
        0.0
    }
}

fn lowpass_coeff(cutoff: f64, sample_rate: f64) -> Sample {
    (1.0 - (-TAU * cutoff / sample_rate).exp()).clamp(0.0, 1.0) as Sample
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
