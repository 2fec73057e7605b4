//! Software CCMP and TKIP link-layer crypto engines for IEEE 802.11 (802.11-2007 §8.3).
//!
//! This crate implements the per-frame confidentiality/integrity transforms only. Key
//! negotiation, key derivation, and frame header parsing are the caller's responsibility;
//! see [`header::FrameHeader`] and [`host::ManagementPlane`] for the collaborator seams.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

pub mod buffer;
pub mod ccmp;
pub mod config;
pub mod countermeasures;
pub mod header;
pub mod host;
pub mod key;
pub mod primitives;
pub mod tkip;

pub use buffer::{BufferChain, SegmentAllocator};
pub use ccmp::Ccmp;
pub use config::EngineConfig;
pub use countermeasures::{Clock, MichaelFailureController};
pub use header::FrameHeader;
pub use key::Key;
pub use tkip::Tkip;

/// Error surfaced only at key install time. Per-frame faults never produce a `CryptoError`;
/// they are reported as `None` so that no information about the cause of a discard reaches
/// the wire (see `decrypt` contracts on [`Cipher`]).
#[derive(Debug, Fail)]
pub enum CryptoError {
    #[fail(display = "key material has wrong length: expected {}, got {}", expected, actual)]
    InvalidKeyLength { expected: usize, actual: usize },

    #[fail(display = "failed to allocate cipher context")]
    NoMemory,
}

/// Shared shape of a software (or hardware-offload) cipher engine.
///
/// Both [`Ccmp`] and [`Tkip`] implement this so that a caller can dispatch on a cipher
/// identifier without caring which engine backs a given key.
pub trait Cipher {
    /// Run whatever one-time setup a key needs (AES key schedule, Michael sub-key
    /// assignment, ...) and store it in `key`'s private state.
    fn install(&self, key: &mut Key) -> Result<(), CryptoError>;

    /// Release any private state held by `key`. Idempotent.
    fn delete(&self, key: &mut Key);

    /// Encrypt `frame` in place over `key`, returning a new chain with header/trailer
    /// added, or `None` if a buffer allocation failed anywhere along the way (both the
    /// input chain and any partial output are released before returning).
    fn encrypt(
        &self,
        frame: BufferChain,
        key: &mut Key,
        allocator: &dyn SegmentAllocator,
    ) -> Option<BufferChain>;

    /// Decrypt and authenticate `frame` over `key`. Returns `None` on any of: a too-short
    /// frame, a missing ExtIV bit, a replayed packet number, an ICV mismatch (TKIP only),
    /// or a MIC mismatch. A `None` return never advances `key`'s replay counters.
    fn decrypt(
        &self,
        frame: BufferChain,
        key: &mut Key,
        allocator: &dyn SegmentAllocator,
    ) -> Option<BufferChain>;
}
