//! RC4-style stream cipher, wire-compatible with the remote ioserver.
//!
//! This is a compatibility requirement, not a security recommendation: RC4
//! has no integrity tag and known biases. The wire format mandates it and we
//! do not substitute a different cipher.

const STATE_LEN: usize = 256;

/// One keyed RC4 stream. A connection owns two independent instances
/// (encrypt, decrypt) initialized from the same key; advancing one never
/// affects the other.
#[derive(Clone)]
pub struct Rc4 {
    s: [u8; STATE_LEN],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Initialize from a key of 1..=256 bytes. Only the first 256 bytes of a
    /// longer key participate (moot for this wire format, whose key is
    /// always the 64-byte SHA-512 digest of salt ∥ secret).
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "RC4 key must not be empty");
        let mut s = [0u8; STATE_LEN];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let klen = key.len().min(STATE_LEN);
        let mut j: u8 = 0;
        for i in 0..STATE_LEN {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % klen]);
            s.swap(i, j as usize);
        }
        Rc4 { s, i: 0, j: 0 }
    }

    /// Advance the keystream by one byte and return it.
    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
        self.s[idx as usize]
    }

    /// XOR `buf` in place with the keystream, advancing the stream state by
    /// `buf.len()` bytes.
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte ^= self.next_byte();
        }
    }
}

/// The encrypt/decrypt pair for one connection. Both halves are initialized
/// from the same key (the remote side mirrors this symmetry).
pub struct CipherPair {
    pub encrypt: Rc4,
    pub decrypt: Rc4,
}

impl CipherPair {
    pub fn new(key: &[u8]) -> Self {
        CipherPair {
            encrypt: Rc4::new(key),
            decrypt: Rc4::new(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_state_before_schedule_has_distinct_bytes() {
        // The key schedule must be a permutation, not a lossy map.
        let cipher = Rc4::new(b"abc");
        let mut seen = [false; STATE_LEN];
        for &b in &cipher.s {
            assert!(!seen[b as usize], "state is not a permutation");
            seen[b as usize] = true;
        }
    }

    #[test]
    fn known_answer_rc4_drop0() {
        // RFC 6229 test vector: key "Key", plaintext "Plaintext".
        let mut cipher = Rc4::new(b"Key");
        let mut buf = *b"Plaintext";
        cipher.apply_keystream(&mut buf);
        assert_eq!(buf, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    proptest! {
        #[test]
        fn round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..4096), key in proptest::collection::vec(any::<u8>(), 1..=256)) {
            let mut enc = Rc4::new(&key);
            let mut dec = Rc4::new(&key);
            let mut buf = plaintext.clone();
            enc.apply_keystream(&mut buf);
            dec.apply_keystream(&mut buf);
            prop_assert_eq!(buf, plaintext);
        }

        #[test]
        fn independent_streams_dont_interfere(key in proptest::collection::vec(any::<u8>(), 1..=256), a in proptest::collection::vec(any::<u8>(), 1..256), b in proptest::collection::vec(any::<u8>(), 1..256)) {
            // Advancing `encrypt` must not change what `decrypt` produces for
            // the same input, and vice versa.
            let pair = CipherPair::new(&key);
            let mut enc1 = pair.encrypt.clone();
            let mut dec1 = pair.decrypt.clone();
            let mut a_buf = a.clone();
            enc1.apply_keystream(&mut a_buf);
            let mut b_buf = b.clone();
            dec1.apply_keystream(&mut b_buf);

            // Re-derive fresh streams and apply in the other order.
            let mut dec2 = pair.decrypt.clone();
            let mut enc2 = pair.encrypt.clone();
            let mut b_buf2 = b.clone();
            dec2.apply_keystream(&mut b_buf2);
            let mut a_buf2 = a.clone();
            enc2.apply_keystream(&mut a_buf2);

            prop_assert_eq!(a_buf, a_buf2);
            prop_assert_eq!(b_buf, b_buf2);
        }
    }
}
