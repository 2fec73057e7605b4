//! CCMP: Counter Mode with CBC-MAC, IEEE 802.11-2007 §8.3.3. CCMP fixes the CCM parameters
//! at M = 8 (MIC length), L = 2 (length-field width), giving a 13-byte nonce and a 16-bit
//! counter field.

use crate::buffer::{BufferChain, SegmentAllocator, Writer};
use crate::config::CcmParams;
use crate::header::{FrameClass, FrameHeader};
use crate::key::{Key, PrivateState};
use crate::primitives::{constant_time_eq, Aes128Encryptor};
use crate::{Cipher, CryptoError};

pub const HDR_LEN: usize = 8;

fn build_aad(header: &FrameHeader) -> [u8; 32] {
    let mut auth = [0u8; 32];
    let mut i = 2;

    let mut fc0 = header.fc0();
    if header.class() == FrameClass::Data {
        fc0 &= !0xF0;
    }
    auth[i] = fc0;
    i += 1;

    let mut fc1 = header.fc1();
    fc1 &= !(0x08 | 0x10 | 0x20);
    if header.has_htc() {
        fc1 &= !0x80;
    }
    auth[i] = fc1;
    i += 1;

    auth[i..i + 6].copy_from_slice(&header.addr1());
    i += 6;
    auth[i..i + 6].copy_from_slice(&header.addr2());
    i += 6;
    auth[i..i + 6].copy_from_slice(&header.addr3());
    i += 6;

    auth[i] = header.seq_ctrl_low() & !0xF0;
    i += 1;
    auth[i] = 0;
    i += 1;

    if let Some(a4) = header.addr4() {
        auth[i..i + 6].copy_from_slice(&a4);
        i += 6;
    }

    if header.has_qos() {
        auth[i] = header.qos_tid();
        i += 1;
        auth[i] = 0;
        i += 1;
    }

    let la = i - 2;
    auth[0] = (la >> 8) as u8;
    auth[1] = la as u8;
    auth
}

fn build_nonce(header: &FrameHeader, pn: u64) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    let mut byte0 = header.qos_tid();
    if header.class() == FrameClass::Management {
        byte0 |= 1 << 4;
    }
    nonce[0] = byte0;
    nonce[1..7].copy_from_slice(&header.addr2());
    nonce[7] = (pn >> 40) as u8;
    nonce[8] = (pn >> 32) as u8;
    nonce[9] = (pn >> 24) as u8;
    nonce[10] = (pn >> 16) as u8;
    nonce[11] = (pn >> 8) as u8;
    nonce[12] = pn as u8;
    nonce
}

/// Construct B_0, the zero counter block A_0/S_0, given the frame's AAD-relevant header
/// fields, its packet number, and the plaintext length.
fn phase1(
    aes: &Aes128Encryptor,
    header: &FrameHeader,
    pn: u64,
    payload_len: usize,
) -> ([u8; 16], [u8; 16], [u8; 16]) {
    let auth = build_aad(header);
    let nonce = build_nonce(header, pn);

    let mut b = [0u8; 16];
    b[0] = 0x59; // Adata=1, (M-2)/2=3, L-1=1
    b[1..14].copy_from_slice(&nonce);
    b[14] = (payload_len >> 8) as u8;
    b[15] = payload_len as u8;
    aes.encrypt_block(&mut b);

    for i in 0..16 {
        b[i] ^= auth[i];
    }
    aes.encrypt_block(&mut b);
    for i in 0..16 {
        b[i] ^= auth[16 + i];
    }
    aes.encrypt_block(&mut b);

    let mut a = [0u8; 16];
    a[0] = 0x01; // L-1
    a[1..14].copy_from_slice(&nonce);

    let mut s0 = a;
    aes.encrypt_block(&mut s0);

    (b, a, s0)
}

fn counter_block(aes: &Aes128Encryptor, a_template: &[u8; 16], ctr: u16) -> [u8; 16] {
    let mut a = *a_template;
    a[14] = (ctr >> 8) as u8;
    a[15] = ctr as u8;
    aes.encrypt_block(&mut a);
    a
}

pub struct Ccmp {
    pub params: CcmParams,
}

impl Ccmp {
    pub fn new(params: CcmParams) -> Self {
        Ccmp { params }
    }
}

impl Default for Ccmp {
    fn default() -> Self {
        Ccmp::new(CcmParams::default())
    }
}

impl Cipher for Ccmp {
    fn install(&self, key: &mut Key) -> Result<(), CryptoError> {
        if key.bytes.len() < 16 {
            return Err(CryptoError::InvalidKeyLength { expected: 16, actual: key.bytes.len() });
        }
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&key.bytes[..16]);
        key.private = Some(PrivateState::Ccmp { aes: Aes128Encryptor::new(&raw) });
        debug!("installed CCMP key id={}", key.id);
        Ok(())
    }

    fn delete(&self, key: &mut Key) {
        key.private = None;
        debug!("deleted CCMP key id={}", key.id);
    }

    fn encrypt(
        &self,
        frame: BufferChain,
        key: &mut Key,
        allocator: &dyn SegmentAllocator,
    ) -> Option<BufferChain> {
        let header_bytes: Vec<u8> = frame.first_segment()?.to_vec();
        let header = FrameHeader::parse(&header_bytes);
        let hdrlen = header.header_length();
        if header_bytes.len() < hdrlen {
            return None;
        }

        key.tx_counter += 1;
        let pn = key.tx_counter;

        let aes = match &key.private {
            Some(PrivateState::Ccmp { aes }) => aes,
            _ => return None,
        };

        let payload_len = frame.total_len() - hdrlen;
        let (mut mic_acc, a_template, s0) = phase1(aes, &header, pn, payload_len);
        let mut s = counter_block(aes, &a_template, 1);

        let mut writer = Writer::new(allocator);
        if writer.write(&header_bytes[..hdrlen]) != hdrlen {
            return None;
        }
        let ccmp_hdr = [
            pn as u8,
            (pn >> 8) as u8,
            0,
            (key.id << 6) | 0x20,
            (pn >> 16) as u8,
            (pn >> 24) as u8,
            (pn >> 32) as u8,
            (pn >> 40) as u8,
        ];
        if writer.write(&ccmp_hdr) != HDR_LEN {
            return None;
        }

        let mut reader = frame.reader();
        reader.seek(hdrlen);
        let mut j = 0usize;
        let mut ctr = 1u16;
        let mut remaining = payload_len;
        while remaining > 0 {
            let run = reader.run(remaining);
            if run.is_empty() {
                return None;
            }
            for &pt in run {
                let ct = pt ^ s[j];
                mic_acc[j] ^= pt;
                if !writer.push_byte(ct) {
                    return None;
                }
                j += 1;
                if j == 16 {
                    aes.encrypt_block(&mut mic_acc);
                    ctr += 1;
                    s = counter_block(aes, &a_template, ctr);
                    j = 0;
                }
            }
            reader.advance(run.len());
            remaining -= run.len();
        }
        if j != 0 {
            aes.encrypt_block(&mut mic_acc);
        }

        let mut mic = [0u8; 8];
        for i in 0..self.params.mic_len {
            mic[i] = mic_acc[i] ^ s0[i];
        }
        if writer.write(&mic[..self.params.mic_len]) != self.params.mic_len {
            return None;
        }

        writer.into_chain()
    }

    fn decrypt(
        &self,
        frame: BufferChain,
        key: &mut Key,
        allocator: &dyn SegmentAllocator,
    ) -> Option<BufferChain> {
        let mic_len = self.params.mic_len;
        let header_bytes: Vec<u8> = frame.first_segment()?.to_vec();
        let header = FrameHeader::parse(&header_bytes);
        let hdrlen = header.header_length();

        if frame.total_len() < hdrlen + HDR_LEN + mic_len {
            return None;
        }
        if header_bytes.len() < hdrlen + HDR_LEN {
            return None;
        }
        let ivp = &header_bytes[hdrlen..hdrlen + HDR_LEN];
        if ivp[3] & 0x20 == 0 {
            return None;
        }

        let is_data = header.class() == FrameClass::Data;
        let tid = header.qos_tid();
        let pn = u64::from(ivp[0])
            | u64::from(ivp[1]) << 8
            | u64::from(ivp[4]) << 16
            | u64::from(ivp[5]) << 24
            | u64::from(ivp[6]) << 32
            | u64::from(ivp[7]) << 40;

        let prior = if is_data { key.rx_counter[usize::from(tid & 0x07)] } else { key.rx_counter_mgmt };
        if pn <= prior {
            warn!("CCMP replay rejected: pn={} <= counter={}", pn, prior);
            return None;
        }

        let aes = match &key.private {
            Some(PrivateState::Ccmp { aes }) => aes,
            _ => return None,
        };

        let payload_len = frame.total_len() - hdrlen - HDR_LEN - mic_len;
        let (mut mic_acc, a_template, s0) = phase1(aes, &header, pn, payload_len);
        let mut s = counter_block(aes, &a_template, 1);

        let mut writer = Writer::new(allocator);
        let mut cleared_header = header_bytes[..hdrlen].to_vec();
        cleared_header[1] &= !0x40; // clear PROTECTED
        if writer.write(&cleared_header) != hdrlen {
            return None;
        }

        let mut reader = frame.reader();
        reader.seek(hdrlen + HDR_LEN);
        let mut j = 0usize;
        let mut ctr = 1u16;
        let mut remaining = payload_len;
        while remaining > 0 {
            let run = reader.run(remaining);
            if run.is_empty() {
                return None;
            }
            for &ct in run {
                let pt = ct ^ s[j];
                mic_acc[j] ^= pt;
                if !writer.push_byte(pt) {
                    return None;
                }
                j += 1;
                if j == 16 {
                    aes.encrypt_block(&mut mic_acc);
                    ctr += 1;
                    s = counter_block(aes, &a_template, ctr);
                    j = 0;
                }
            }
            reader.advance(run.len());
            remaining -= run.len();
        }
        if j != 0 {
            aes.encrypt_block(&mut mic_acc);
        }

        let mut received_mic = [0u8; 8];
        frame.copy_out(hdrlen + HDR_LEN + payload_len, mic_len, &mut received_mic[..mic_len]);

        let mut computed_mic = [0u8; 8];
        for i in 0..mic_len {
            computed_mic[i] = mic_acc[i] ^ s0[i];
        }
        if !constant_time_eq(&computed_mic[..mic_len], &received_mic[..mic_len]) {
            warn!("CCMP MIC mismatch, discarding frame");
            return None;
        }

        if is_data {
            key.rx_counter[usize::from(tid & 0x07)] = pn;
        } else {
            key.rx_counter_mgmt = pn;
        }

        writer.into_chain()
    }
}
