//! Cipher context lifecycle: the `Key` container and its per-cipher private state.

use crate::primitives::Aes128Encryptor;

/// Which role this station plays, controlling which half of a TKIP key is the transmit vs.
/// receive Michael sub-key (802.11-2007 §8.3.2.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authenticator,
    Supplicant,
}

/// Opaque per-cipher state, installed by `Cipher::install` and consulted by
/// `Cipher::encrypt`/`decrypt`. Never constructed outside this crate.
pub enum PrivateState {
    Ccmp { aes: Aes128Encryptor },
    Tkip(Box<TkipState>),
}

/// Cached Phase 1 key mixing output (TTAK, in the original's naming) plus the validity bit
/// that governs whether it may be reused for the next IV16 without recomputing. Kept
/// distinct from `Option` so that a recompute that is itself never confirmed valid (the
/// frame it was computed for fails its MIC) leaves the *value* in place but the *flag*
/// clear, forcing the next frame to recompute rather than silently trusting an unconfirmed
/// cache (802.11-2007 §8.3.2.3.3).
pub struct TkipState {
    pub tx_mic_key: [u8; 8],
    pub rx_mic_key: [u8; 8],
    pub tx_phase1: [u16; 5],
    pub tx_phase1_valid: bool,
    pub rx_phase1: [u16; 5],
    pub rx_phase1_valid: bool,
}

impl Drop for TkipState {
    fn drop(&mut self) {
        self.tx_mic_key = [0; 8];
        self.rx_mic_key = [0; 8];
        self.tx_phase1 = [0; 5];
        self.rx_phase1 = [0; 5];
    }
}

/// A single installed key: raw key material plus per-direction replay counters and the
/// cipher-specific private state.
pub struct Key {
    pub bytes: Vec<u8>,
    pub id: u8,
    pub role: Role,
    pub tx_counter: u64,
    pub rx_counter: [u64; 8],
    pub rx_counter_mgmt: u64,
    pub private: Option<PrivateState>,
}

impl Key {
    pub fn new(bytes: Vec<u8>, id: u8, role: Role) -> Self {
        Key {
            bytes,
            id,
            role,
            tx_counter: 0,
            rx_counter: [0; 8],
            rx_counter_mgmt: 0,
            private: None,
        }
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            *b = 0;
        }
    }
}
