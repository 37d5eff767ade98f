//! Run state shared by the process controller and every transport.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Run state of a process or a single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Not serving.
    Down = 0,
    /// Serving traffic.
    Up = 1,
    /// Refusing new work while in-flight work finishes.
    Drain = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => State::Up,
            2 => State::Drain,
            _ => State::Down,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Down => "down",
            State::Up => "up",
            State::Drain => "drain",
        })
    }
}

/// A [`State`] stored in a single atomic word.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from → to` atomically. Returns `false` (and changes nothing)
    /// when the current state is not `from`.
    pub fn transition(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(State::Down)
    }
}
