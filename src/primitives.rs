//! Uniform adapters over the raw cryptographic primitives the two engines share. AES-128
//! and RC4 come from `rust-crypto`; Michael MIC and the WEP-style CRC32 are hand-rolled leaf
//! functions since `rust-crypto` 0.2 provides neither.

use byteorder::{ByteOrder, LittleEndian};
use crypto::aessafe::AesSafe128Encryptor;
use crypto::rc4::Rc4;
use crypto::symmetriccipher::{BlockEncryptor, SynchronousStreamCipher};

/// Single-block AES-128 encryption, encrypt-only (CCMP never decrypts with AES; CTR mode
/// only ever encrypts counter blocks).
pub struct Aes128Encryptor {
    inner: AesSafe128Encryptor,
}

impl Aes128Encryptor {
    pub fn new(key: &[u8; 16]) -> Self {
        Aes128Encryptor { inner: AesSafe128Encryptor::new(key) }
    }

    pub fn encrypt_block(&self, block: &mut [u8; 16]) {
        let input = *block;
        self.inner.encrypt_block(&input, block);
    }
}

/// RC4 keystream generator, reseeded once per frame from the TKIP per-packet key.
pub struct Rc4Stream {
    inner: Rc4,
}

impl Rc4Stream {
    pub fn new(key: &[u8]) -> Self {
        Rc4Stream { inner: Rc4::new(key) }
    }

    pub fn process(&mut self, input: &[u8], output: &mut [u8]) {
        self.inner.process(input, output);
    }
}

fn xswap(v: u32) -> u32 {
    ((v & 0xff00_ff00) >> 8) | ((v & 0x00ff_00ff) << 8)
}

fn michael_round(l: &mut u32, r: &mut u32) {
    *r ^= l.rotate_left(17);
    *l = l.wrapping_add(*r);
    *r ^= xswap(*l);
    *l = l.wrapping_add(*r);
    *r ^= l.rotate_left(3);
    *l = l.wrapping_add(*r);
    *r ^= l.rotate_right(2);
    *l = l.wrapping_add(*r);
}

/// Streaming Michael MIC context, fed across an arbitrary number of `update` calls so that
/// a scatter-gather chain can be folded in one segment at a time without first linearizing it.
pub struct Michael {
    l: u32,
    r: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl Michael {
    pub fn new(key: &[u8; 8]) -> Self {
        Michael {
            l: LittleEndian::read_u32(&key[0..4]),
            r: LittleEndian::read_u32(&key[4..8]),
            pending: [0; 4],
            pending_len: 0,
        }
    }

    fn absorb_word(&mut self, word: &[u8]) {
        self.l ^= LittleEndian::read_u32(word);
        michael_round(&mut self.l, &mut self.r);
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let need = 4 - self.pending_len;
            let take = need.min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len == 4 {
                let word = self.pending;
                self.absorb_word(&word);
                self.pending_len = 0;
            }
        }
        while data.len() >= 4 {
            let (word, rest) = data.split_at(4);
            self.absorb_word(word);
            data = rest;
        }
        if !data.is_empty() {
            self.pending[..data.len()].copy_from_slice(data);
            self.pending_len = data.len();
        }
    }

    pub fn finalize(mut self) -> [u8; 8] {
        let mut last = [0u8; 4];
        last[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
        last[self.pending_len] = 0x5a;
        self.absorb_word(&last);
        michael_round(&mut self.l, &mut self.r);

        let mut out = [0u8; 8];
        LittleEndian::write_u32(&mut out[0..4], self.l);
        LittleEndian::write_u32(&mut out[4..8], self.r);
        out
    }
}

/// Compute a Michael MIC in one shot over a sequence of byte runs, keyed by an 8-byte
/// Michael sub-key. Kept independent of any [`crate::tkip::Tkip`] state so a hardware-offload
/// driver that only needs MIC (not RC4) can call it directly.
pub fn michael_mic<'a>(key: &[u8; 8], runs: impl IntoIterator<Item = &'a [u8]>) -> [u8; 8] {
    let mut mic = Michael::new(key);
    for run in runs {
        mic.update(run);
    }
    mic.finalize()
}

/// IEEE 802.3 CRC32 (reflected, polynomial 0xEDB88320), run incrementally across buffer
/// segments the way the WEP ICV is computed.
pub fn crc32_le_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    crc
}

pub fn crc32_le_init() -> u32 {
    !0u32
}

pub fn crc32_le_final(crc: u32) -> u32 {
    !crc
}

/// Compare two equal-length byte slices without short-circuiting on the first mismatch, so a
/// MIC check's timing does not leak how many leading bytes an attacker guessed correctly.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
