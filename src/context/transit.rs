//! Causality token for one logical request/flow.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::sideband::SidebandError;
use super::stepper::Stepper;

const TRANSIT_VERSION: u8 = 1;
const SHORT_ID_LEN: usize = 8;

/// A causality token: a global identifier plus a [`Stepper`].
///
/// Cloning a `Transit` yields a handle to the same token (the stepper is
/// shared). Use [`Transit::child`] to fork a deeper stepper for a nested
/// call; the identifier never changes along the chain.
#[derive(Debug, Clone)]
pub struct Transit {
    inner: Arc<TransitInner>,
}

#[derive(Debug)]
struct TransitInner {
    id: String,
    stepper: Stepper,
}

impl Transit {
    /// Mint a fresh transit at a true entry point.
    pub fn new() -> Self {
        Self::from_parts(Uuid::new_v4().simple().to_string(), Stepper::new())
    }

    /// Assemble a transit from an identifier and a stepper.
    pub fn from_parts(id: impl Into<String>, stepper: Stepper) -> Self {
        Self {
            inner: Arc::new(TransitInner {
                id: id.into(),
                stepper,
            }),
        }
    }

    /// Global identifier (32 lowercase hex chars when minted locally).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// First 8 characters of the identifier, or an empty string when the
    /// identifier is shorter than that.
    pub fn short_id(&self) -> &str {
        self.inner.id.get(..SHORT_ID_LEN).unwrap_or("")
    }

    /// Stepper of this transit.
    pub fn stepper(&self) -> &Stepper {
        &self.inner.stepper
    }

    /// Advance the stepper; returns the new step.
    pub fn step(&self) -> u32 {
        self.inner.stepper.increment()
    }

    /// Same identifier, one nesting level deeper.
    pub fn child(&self) -> Self {
        Self::from_parts(self.inner.id.clone(), self.inner.stepper.child())
    }

    /// Binary form: `[version][id_len][id][stepper]`.
    pub fn encode(&self) -> Vec<u8> {
        let id = self.inner.id.as_bytes();
        let mut buf = Vec::with_capacity(2 + id.len() + 8 + 4 * self.inner.stepper.depth());
        buf.push(TRANSIT_VERSION);
        // Ids longer than 255 bytes are never minted; truncating keeps the frame valid.
        let id = &id[..id.len().min(u8::MAX as usize)];
        buf.push(id.len() as u8);
        buf.extend_from_slice(id);
        self.inner.stepper.encode_into(&mut buf);
        buf
    }

    /// Decode the binary form produced by [`Transit::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, SidebandError> {
        let (&version, rest) = data.split_first().ok_or(SidebandError::Truncated)?;
        if version != TRANSIT_VERSION {
            return Err(SidebandError::UnsupportedVersion(version));
        }
        let (&id_len, rest) = rest.split_first().ok_or(SidebandError::Truncated)?;
        let id_len = id_len as usize;
        if id_len == 0 {
            return Err(SidebandError::EmptyTransitId);
        }
        let id = rest.get(..id_len).ok_or(SidebandError::Truncated)?;
        let id = std::str::from_utf8(id).map_err(|_| SidebandError::InvalidTransitId)?;
        let stepper = Stepper::decode(&rest[id_len..])?;
        Ok(Self::from_parts(id, stepper))
    }

    /// True when both handles point at the same token.
    pub fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Transit {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Transit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.id, self.inner.stepper)
    }
}
