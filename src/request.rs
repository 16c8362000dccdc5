//! The 512-byte handshake record plus encrypted DNS payload.
//!
//! ```text
//! +-------+----------+------+-------+------------+
//! | MAGIC |   HOST   | PORT |  SALT |   PAYLOAD   |
//! +-------+----------+------+-------+------------+
//! |   4   |   257    |  15  |  236  |      N      |
//! +-------+----------+------+-------+------------+
//! ```
//! `HOST`/`PORT` are NUL-padded ASCII. `SALT` is fresh randomness per
//! connection and stays in clear on the wire; it both seeds the key
//! derivation and fills the handshake record. `MAGIC`, `HOST`, and `PORT`
//! are encrypted; `SALT` is not; `PAYLOAD` is encrypted with the same
//! stream, sequentially after the header.

use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::cipher::CipherPair;

pub const MAGIC: u32 = 0x526F_6E61;
pub(crate) const HOST_LEN: usize = 257;
pub(crate) const PORT_LEN: usize = 15;
const SALT_LEN: usize = 236;
pub const HEADER_LEN: usize = 4 + HOST_LEN + PORT_LEN + SALT_LEN; // 512
const SALT_OFFSET: usize = 4 + HOST_LEN + PORT_LEN; // 276

/// A built handshake record together with the cipher state it was encrypted
/// under (the same state continues over the reply on the decrypt side).
pub struct Request {
    pub record: Vec<u8>,
    pub cipher: CipherPair,
}

/// Write `host`/`port` into a fixed-width NUL-padded ASCII field. Panics if
/// either does not fit — callers validate at config-load time instead of at
/// every query.
fn write_fixed_ascii(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    assert!(bytes.len() < dst.len(), "field value too long for fixed-width slot");
    dst[..bytes.len()].copy_from_slice(bytes);
}

/// Build the encrypted handshake record + payload for one query.
///
/// `payload` is the already-framed DNS message (TCP: the client's
/// length-prefixed bytes verbatim; UDP: a 2-byte length prefix followed by
/// the bare message — see [`crate::dns`]).
pub fn build_request(upstream_host: &str, upstream_port: &str, secret: &[u8], payload: &[u8]) -> Request {
    let mut record = vec![0u8; HEADER_LEN + payload.len()];

    record[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    write_fixed_ascii(&mut record[4..4 + HOST_LEN], upstream_host);
    write_fixed_ascii(&mut record[4 + HOST_LEN..4 + HOST_LEN + PORT_LEN], upstream_port);

    rand::thread_rng().fill_bytes(&mut record[SALT_OFFSET..SALT_OFFSET + SALT_LEN]);

    let key = derive_key(&record[SALT_OFFSET..SALT_OFFSET + SALT_LEN], secret);
    let mut cipher = CipherPair::new(&key);

    cipher.encrypt.apply_keystream(&mut record[0..SALT_OFFSET]);

    record[HEADER_LEN..].copy_from_slice(payload);
    cipher.encrypt.apply_keystream(&mut record[HEADER_LEN..]);

    Request { record, cipher }
}

/// `SHA-512(salt ∥ secret)`, used as the 64-byte RC4 key for both cipher
/// halves of the connection.
pub fn derive_key(salt: &[u8], secret: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().into()
}
