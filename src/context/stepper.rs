//! Hierarchical monotonic counter.
//!
//! A stepper derives comparable operation identifiers inside one causal
//! chain without a central sequencer. Each nesting level owns one `u32`
//! counter; only the counter at `index` is ever advanced.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use super::sideband::SidebandError;

/// A hierarchical counter, one level per nesting depth.
#[derive(Debug)]
pub struct Stepper {
    steps: Vec<AtomicU32>,
    index: usize,
}

impl Stepper {
    /// Create a root stepper with a single zero-valued level.
    pub fn new() -> Self {
        Self {
            steps: vec![AtomicU32::new(0)],
            index: 0,
        }
    }

    /// Build a stepper from raw levels.
    ///
    /// Returns `None` when `index` does not point at an existing level.
    pub fn from_parts(steps: Vec<u32>, index: usize) -> Option<Self> {
        if index >= steps.len() {
            return None;
        }
        Some(Self {
            steps: steps.into_iter().map(AtomicU32::new).collect(),
            index,
        })
    }

    /// Advance the active level and return its new value.
    ///
    /// Safe under concurrent callers: no increment is lost or duplicated.
    pub fn increment(&self) -> u32 {
        self.steps[self.index].fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Fork a new stepper one level deeper.
    ///
    /// The child copies the current values of every level, appends a zero
    /// level and points at it. It shares no state with `self`.
    pub fn child(&self) -> Self {
        let mut steps = self.snapshot();
        steps.push(0);
        let index = steps.len() - 1;
        Self {
            steps: steps.into_iter().map(AtomicU32::new).collect(),
            index,
        }
    }

    /// Current values of every level.
    pub fn snapshot(&self) -> Vec<u32> {
        self.steps.iter().map(|s| s.load(Ordering::SeqCst)).collect()
    }

    /// Index of the level being incremented.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Append the binary form to `buf`: `[index u32][count u32][count × u32]`, big-endian.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let steps = self.snapshot();
        buf.extend_from_slice(&(self.index as u32).to_be_bytes());
        buf.extend_from_slice(&(steps.len() as u32).to_be_bytes());
        for step in steps {
            buf.extend_from_slice(&step.to_be_bytes());
        }
    }

    /// Binary form of this stepper.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 * self.steps.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a stepper from the front of `data`, returning it with the
    /// number of bytes consumed.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize), SidebandError> {
        let index = read_u32(data, 0)? as usize;
        let count = read_u32(data, 4)? as usize;
        let needed = 8usize
            .checked_add(count.checked_mul(4).ok_or(SidebandError::Truncated)?)
            .ok_or(SidebandError::Truncated)?;
        if data.len() < needed {
            return Err(SidebandError::Truncated);
        }

        let steps = (0..count)
            .map(|i| read_u32(data, 8 + i * 4))
            .collect::<Result<Vec<_>, _>>()?;
        let stepper = Self::from_parts(steps, index).ok_or(SidebandError::InvalidStepper {
            index,
            depth: count,
        })?;
        Ok((stepper, needed))
    }

    /// Decode a stepper that occupies all of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, SidebandError> {
        let (stepper, used) = Self::decode_prefix(data)?;
        if used != data.len() {
            return Err(SidebandError::TrailingBytes(data.len() - used));
        }
        Ok(stepper)
    }
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, SidebandError> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(SidebandError::Truncated)?;
    Ok(u32::from_be_bytes(bytes))
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Stepper {
    fn clone(&self) -> Self {
        Self {
            steps: self.snapshot().into_iter().map(AtomicU32::new).collect(),
            index: self.index,
        }
    }
}

impl PartialEq for Stepper {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.snapshot() == other.snapshot()
    }
}

impl Eq for Stepper {}

impl fmt::Display for Stepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.snapshot().iter().enumerate() {
            if i > 0 {
                f.write_str("_")?;
            }
            write!(f, "{:04}", step)?;
        }
        Ok(())
    }
}
