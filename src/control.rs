//! Control messages for control → RT communication.
//!
//! Messages travel through a lock-free SPSC queue from the control context to
//! the audio callback, which drains the queue at the start of every block.
//!
//! # Design Philosophy
//!
//! Everything that crosses into the audio context is:
//! - Fixed-size (names and symbols are stored inline, never on the heap)
//! - Copy, except graph swaps, which carry a runtime built on the control side
//! - Self-contained (no references into control-side data)

use crate::rt::Runtime;
use std::collections::VecDeque;
use std::fmt;

/// Capacity of the command queue between control and RT.
/// Should absorb bursts of messages sent between two blocks.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Longest receiver name or symbol, in bytes.
pub const NAME_CAPACITY: usize = 31;

/// Errors when building an inline [`Name`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Empty string.
    #[error("name is empty")]
    Empty,
    /// Longer than [`NAME_CAPACITY`] bytes.
    #[error("`{0}` is longer than {NAME_CAPACITY} bytes")]
    TooLong(String),
    /// Contains whitespace, which the patch grammar cannot express.
    #[error("`{0}` contains whitespace")]
    Whitespace(String),
}

/// A short string stored inline, safe to move through the RT queue.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name {
    bytes: [u8; NAME_CAPACITY],
    len: u8,
}

impl Name {
    /// Copy `text` into an inline name.
    pub fn new(text: &str) -> Result<Self, NameError> {
        if text.is_empty() {
            return Err(NameError::Empty);
        }
        if text.len() > NAME_CAPACITY {
            return Err(NameError::TooLong(text.to_string()));
        }
        if text.chars().any(char::is_whitespace) {
            return Err(NameError::Whitespace(text.to_string()));
        }
        let mut bytes = [0u8; NAME_CAPACITY];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Self {
            bytes,
            len: text.len() as u8,
        })
    }

    /// View as `&str`.
    pub fn as_str(&self) -> &str {
        // Always built from a &str, so the prefix is valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", self.as_str())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a control message, Pd style.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// Trigger without a value.
    Bang,
    /// Numeric value.
    Float(f64),
    /// Short symbol.
    Symbol(Name),
}

/// A control message addressed to a named target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Message {
    /// Receiver name declared by the bound graph.
    pub target: Name,
    /// What to deliver.
    pub payload: Payload,
}

impl Message {
    /// Build a message, checking the target name.
    pub fn new(target: &str, payload: Payload) -> Result<Self, NameError> {
        Ok(Self {
            target: Name::new(target)?,
            payload,
        })
    }

    /// `bang` to `target`.
    pub fn bang(target: &str) -> Result<Self, NameError> {
        Self::new(target, Payload::Bang)
    }

    /// `float` to `target`.
    pub fn float(target: &str, value: f64) -> Result<Self, NameError> {
        Self::new(target, Payload::Float(value))
    }

    /// `symbol` to `target`.
    pub fn symbol(target: &str, symbol: &str) -> Result<Self, NameError> {
        Self::new(target, Payload::Symbol(Name::new(symbol)?))
    }
}

/// Commands consumed by the scheduler at a block boundary, in FIFO order.
pub(crate) enum Command {
    /// Replace the bound runtime.
    Bind(Box<Runtime>),
    /// Drop the bound runtime; blocks render silence.
    Unbind,
    /// Deliver a message to the bound runtime's receivers.
    Message(Message),
}

impl Command {
    pub(crate) fn is_swap(&self) -> bool {
        matches!(self, Command::Bind(_) | Command::Unbind)
    }

    /// Returns a human-readable description (for debugging).
    pub(crate) fn description(&self) -> &'static str {
        match self {
            Command::Bind(_) => "Bind",
            Command::Unbind => "Unbind",
            Command::Message(_) => "Message",
        }
    }
}

/// Control-side holding area for commands the RT queue cannot take yet.
///
/// Swaps are never dropped. Messages are bounded: once more than `capacity`
/// are waiting, the oldest waiting message is evicted and handed back.
pub(crate) struct Backlog {
    commands: VecDeque<Command>,
    messages: usize,
    capacity: usize,
}

impl Backlog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            commands: VecDeque::new(),
            messages: 0,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn message_count(&self) -> usize {
        self.messages
    }

    /// Queue a message; returns the evicted oldest message on overflow.
    pub(crate) fn push_message(&mut self, message: Message) -> Option<Message> {
        self.commands.push_back(Command::Message(message));
        self.messages += 1;
        if self.messages <= self.capacity {
            return None;
        }
        let oldest = self
            .commands
            .iter()
            .position(|c| matches!(c, Command::Message(_)))?;
        match self.commands.remove(oldest) {
            Some(Command::Message(evicted)) => {
                self.messages -= 1;
                Some(evicted)
            }
            _ => None,
        }
    }

    /// Queue a swap. A swap directly behind another swap supersedes it; the
    /// superseded command is returned so its runtime is freed by the caller.
    pub(crate) fn push_swap(&mut self, command: Command) -> Option<Command> {
        debug_assert!(command.is_swap());
        let superseded = match self.commands.back() {
            Some(last) if last.is_swap() => self.commands.pop_back(),
            _ => None,
        };
        self.commands.push_back(command);
        superseded
    }

    pub(crate) fn pop_front(&mut self) -> Option<Command> {
        let command = self.commands.pop_front()?;
        if matches!(command, Command::Message(_)) {
            self.messages -= 1;
        }
        Some(command)
    }

    pub(crate) fn push_front(&mut self, command: Command) {
        if matches!(command, Command::Message(_)) {
            self.messages += 1;
        }
        self.commands.push_front(command);
    }
}
