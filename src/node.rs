//! Node kind registry: the closed set of node kinds a patch may name.

#![forbid(unsafe_code)]

use std::fmt;

/// Most input ports any kind declares (a full `mix~`).
pub const MAX_INPUT_PORTS: usize = 8;

/// Most output ports any kind declares.
pub const MAX_OUTPUT_PORTS: usize = 1;

/// Types of nodes in the signal graph, with their creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Sine oscillator; input 0 adds to the frequency.
    Osc {
        /// Frequency in Hz.
        freq: f32,
    },
    /// Rising sawtooth in `0..1`; input 0 adds to the frequency.
    Phasor {
        /// Frequency in Hz.
        freq: f32,
    },
    /// White noise in `-1..1`.
    Noise {
        /// Generator seed.
        seed: u32,
    },
    /// Multiplies its input by a factor.
    Gain {
        /// Gain factor (1.0 = unity gain).
        gain: f32,
    },
    /// Product of two signals.
    Multiply,
    /// Sum of `inputs` signals.
    Mixer {
        /// Number of input ports.
        inputs: usize,
    },
    /// One-pole lowpass filter.
    Lowpass {
        /// Cutoff in Hz.
        cutoff: f32,
    },
    /// Attack/decay envelope triggered by messages.
    Envelope {
        /// Attack time in milliseconds.
        attack_ms: f32,
        /// Decay time in milliseconds.
        decay_ms: f32,
    },
    /// Constant signal, set by messages.
    Sig {
        /// Initial value.
        value: f32,
    },
    /// Device input channel.
    Adc {
        /// Interleaved input channel index.
        channel: usize,
    },
    /// Device output channel (sink).
    Dac {
        /// Interleaved output channel index.
        channel: usize,
    },
    /// Passes input 0 through unchanged.
    Through,
}

/// Errors when resolving a kind name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KindError {
    /// No kind registered under this name.
    #[error("unknown node kind `{0}`")]
    UnknownKind(String),
    /// Too many arguments.
    #[error("`{kind}` takes at most {max} argument(s), got {found}")]
    TooManyArguments {
        /// Kind name.
        kind: &'static str,
        /// Accepted maximum.
        max: usize,
        /// Supplied count.
        found: usize,
    },
    /// An argument that does not parse or is out of range.
    #[error("`{kind}`: bad argument `{arg}`: {reason}")]
    BadArgument {
        /// Kind name.
        kind: &'static str,
        /// Offending token.
        arg: String,
        /// What was expected.
        reason: &'static str,
    },
}

/// Every registered kind name, in declaration order.
pub const KIND_NAMES: &[&str] = &[
    "osc~", "phasor~", "noise~", "*~", "mul~", "mix~", "lop~", "env~", "sig~", "adc~", "dac~",
    "through~",
];

impl NodeKind {
    /// Registry name used in patches.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Osc { .. } => "osc~",
            NodeKind::Phasor { .. } => "phasor~",
            NodeKind::Noise { .. } => "noise~",
            NodeKind::Gain { .. } => "*~",
            NodeKind::Multiply => "mul~",
            NodeKind::Mixer { .. } => "mix~",
            NodeKind::Lowpass { .. } => "lop~",
            NodeKind::Envelope { .. } => "env~",
            NodeKind::Sig { .. } => "sig~",
            NodeKind::Adc { .. } => "adc~",
            NodeKind::Dac { .. } => "dac~",
            NodeKind::Through => "through~",
        }
    }

    /// Number of input ports.
    pub fn input_count(&self) -> usize {
        match self {
            NodeKind::Osc { .. } | NodeKind::Phasor { .. } => 1,
            NodeKind::Gain { .. } | NodeKind::Lowpass { .. } | NodeKind::Dac { .. } => 1,
            NodeKind::Through => 1,
            NodeKind::Multiply => 2,
            NodeKind::Mixer { inputs } => *inputs,
            NodeKind::Noise { .. }
            | NodeKind::Envelope { .. }
            | NodeKind::Sig { .. }
            | NodeKind::Adc { .. } => 0,
        }
    }

    /// Number of output ports.
    pub fn output_count(&self) -> usize {
        match self {
            NodeKind::Dac { .. } => 0,
            _ => 1,
        }
    }

    /// Number of leading input ports that must be connected.
    pub fn required_inputs(&self) -> usize {
        match self {
            NodeKind::Gain { .. } | NodeKind::Lowpass { .. } | NodeKind::Dac { .. } => 1,
            NodeKind::Multiply => 2,
            _ => 0,
        }
    }

    /// Resolve a registry name and its creation arguments.
    pub fn from_tokens(name: &str, args: &[&str]) -> Result<Self, KindError> {
        let kind = match name {
            "osc~" => {
                let kind = "osc~";
                max_args(kind, args, 1)?;
                NodeKind::Osc {
                    freq: float_arg(kind, args, 0, 0.0)?,
                }
            }
            "phasor~" => {
                let kind = "phasor~";
                max_args(kind, args, 1)?;
                NodeKind::Phasor {
                    freq: float_arg(kind, args, 0, 0.0)?,
                }
            }
            "noise~" => {
                let kind = "noise~";
                max_args(kind, args, 1)?;
                let seed = match args.first() {
                    Some(arg) => arg.parse::<u32>().map_err(|_| KindError::BadArgument {
                        kind,
                        arg: arg.to_string(),
                        reason: "expected an unsigned integer seed",
                    })?,
                    None => 1,
                };
                NodeKind::Noise { seed }
            }
            "*~" => {
                let kind = "*~";
                max_args(kind, args, 1)?;
                NodeKind::Gain {
                    gain: float_arg(kind, args, 0, 1.0)?,
                }
            }
            "mul~" => {
                max_args("mul~", args, 0)?;
                NodeKind::Multiply
            }
            "mix~" => {
                let kind = "mix~";
                max_args(kind, args, 1)?;
                NodeKind::Mixer {
                    inputs: index_arg(kind, args, 0, 2)?,
                }
            }
            "lop~" => {
                let kind = "lop~";
                max_args(kind, args, 1)?;
                NodeKind::Lowpass {
                    cutoff: float_arg(kind, args, 0, 1000.0)?,
                }
            }
            "env~" => {
                let kind = "env~";
                max_args(kind, args, 2)?;
                NodeKind::Envelope {
                    attack_ms: float_arg(kind, args, 0, 5.0)?,
                    decay_ms: float_arg(kind, args, 1, 250.0)?,
                }
            }
            "sig~" => {
                let kind = "sig~";
                max_args(kind, args, 1)?;
                NodeKind::Sig {
                    value: float_arg(kind, args, 0, 0.0)?,
                }
            }
            "adc~" => {
                let kind = "adc~";
                max_args(kind, args, 1)?;
                NodeKind::Adc {
                    channel: index_arg(kind, args, 0, 0)?,
                }
            }
            "dac~" => {
                let kind = "dac~";
                max_args(kind, args, 1)?;
                NodeKind::Dac {
                    channel: index_arg(kind, args, 0, 0)?,
                }
            }
            "through~" => {
                max_args("through~", args, 0)?;
                NodeKind::Through
            }
            other => return Err(KindError::UnknownKind(other.to_string())),
        };
        kind.check()?;
        Ok(kind)
    }

    /// Check the creation parameters: finite numbers, `mix~` between 1 and
    /// [`MAX_INPUT_PORTS`] inputs, no negative cutoff or envelope time.
    ///
    /// Kinds built through [`NodeKind::from_tokens`] always pass.
    pub fn check(&self) -> Result<(), KindError> {
        let kind = self.name();
        let bad = |arg: String, reason: &'static str| KindError::BadArgument { kind, arg, reason };
        let finite = |v: f32| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(bad(v.to_string(), "expected a finite number"))
            }
        };
        match *self {
            NodeKind::Osc { freq } | NodeKind::Phasor { freq } => finite(freq),
            NodeKind::Gain { gain } => finite(gain),
            NodeKind::Sig { value } => finite(value),
            NodeKind::Mixer { inputs } if inputs == 0 || inputs > MAX_INPUT_PORTS => Err(bad(
                inputs.to_string(),
                "input count must be between 1 and 8",
            )),
            NodeKind::Lowpass { cutoff } => {
                finite(cutoff)?;
                if cutoff < 0.0 {
                    return Err(bad(cutoff.to_string(), "cutoff must not be negative"));
                }
                Ok(())
            }
            NodeKind::Envelope {
                attack_ms,
                decay_ms,
            } => {
                finite(attack_ms)?;
                finite(decay_ms)?;
                if attack_ms < 0.0 || decay_ms < 0.0 {
                    return Err(bad(
                        format!("{} {}", attack_ms, decay_ms),
                        "times must not be negative",
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Prints the registry name followed by every parameter, so that
/// `from_tokens` on the printed tokens yields an equal kind.
impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            NodeKind::Osc { freq } | NodeKind::Phasor { freq } => write!(f, " {}", freq),
            NodeKind::Noise { seed } => write!(f, " {}", seed),
            NodeKind::Gain { gain } => write!(f, " {}", gain),
            NodeKind::Mixer { inputs } => write!(f, " {}", inputs),
            NodeKind::Lowpass { cutoff } => write!(f, " {}", cutoff),
            NodeKind::Envelope {
                attack_ms,
                decay_ms,
            } => write!(f, " {} {}", attack_ms, decay_ms),
            NodeKind::Sig { value } => write!(f, " {}", value),
            NodeKind::Adc { channel } | NodeKind::Dac { channel } => write!(f, " {}", channel),
            NodeKind::Multiply | NodeKind::Through => Ok(()),
        }
    }
}

fn max_args(kind: &'static str, args: &[&str], max: usize) -> Result<(), KindError> {
    if args.len() > max {
        return Err(KindError::TooManyArguments {
            kind,
            max,
            found: args.len(),
        });
    }
    Ok(())
}

fn float_arg(kind: &'static str, args: &[&str], idx: usize, default: f32) -> Result<f32, KindError> {
    let Some(arg) = args.get(idx) else {
        return Ok(default);
    };
    match arg.parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(KindError::BadArgument {
            kind,
            arg: arg.to_string(),
            reason: "expected a finite number",
        }),
    }
}

fn index_arg(kind: &'static str, args: &[&str], idx: usize, default: usize) -> Result<usize, KindError> {
    let Some(arg) = args.get(idx) else {
        return Ok(default);
    };
    arg.parse::<usize>().map_err(|_| KindError::BadArgument {
        kind,
        arg: arg.to_string(),
        reason: "expected a non-negative integer",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_registered_name_resolves_with_defaults() {
        for name in KIND_NAMES {
            let kind = NodeKind::from_tokens(name, &[]).unwrap();
            assert_eq!(kind.name(), *name);
            assert!(kind.input_count() <= MAX_INPUT_PORTS);
            assert!(kind.output_count() <= MAX_OUTPUT_PORTS);
            assert!(kind.required_inputs() <= kind.input_count());
        }
    }

    #[test]
    fn display_round_trips_through_tokens() {
        let kinds = [
            NodeKind::Osc { freq: 440.5 },
            NodeKind::Noise { seed: 7 },
            NodeKind::Mixer { inputs: 5 },
            NodeKind::Envelope {
                attack_ms: 0.25,
                decay_ms: 1000.0,
            },
            NodeKind::Dac { channel: 1 },
            NodeKind::Multiply,
        ];
        for kind in kinds {
            let text = kind.to_string();
            let tokens: Vec<&str> = text.split_whitespace().collect();
            assert_eq!(NodeKind::from_tokens(tokens[0], &tokens[1..]).unwrap(), kind);
        }
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert_eq!(
            NodeKind::from_tokens("tabread4~", &[]),
            Err(KindError::UnknownKind("tabread4~".into()))
        );
        assert!(matches!(
            NodeKind::from_tokens("osc~", &["fast"]),
            Err(KindError::BadArgument { kind: "osc~", .. })
        ));
        assert!(matches!(
            NodeKind::from_tokens("mix~", &["9"]),
            Err(KindError::BadArgument { .. })
        ));
        assert!(matches!(
            NodeKind::from_tokens("mul~", &["1"]),
            Err(KindError::TooManyArguments { max: 0, found: 1, .. })
        ));
        assert!(NodeKind::from_tokens("osc~", &["inf"]).is_err());
    }

    #[test]
    fn check_catches_parameters_the_grammar_refuses() {
        let bad = [
            NodeKind::Mixer { inputs: 0 },
            NodeKind::Mixer {
                inputs: MAX_INPUT_PORTS + 1,
            },
            NodeKind::Lowpass { cutoff: -1.0 },
            NodeKind::Envelope {
                attack_ms: 5.0,
                decay_ms: -0.5,
            },
            NodeKind::Osc { freq: f32::NAN },
            NodeKind::Gain {
                gain: f32::INFINITY,
            },
        ];
        for kind in bad {
            assert!(
                matches!(kind.check(), Err(KindError::BadArgument { .. })),
                "{:?}",
                kind
            );
        }
        assert_eq!(NodeKind::Mixer { inputs: 8 }.check(), Ok(()));
        assert_eq!(NodeKind::Lowpass { cutoff: 0.0 }.check(), Ok(()));
    }
}
