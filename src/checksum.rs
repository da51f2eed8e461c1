//! Streaming CRC32C and MD5 computation.
//!
//! Every ingress write path (simple upload, resumable commit, compose,
//! copy, seeding) tees its bytes through a [`ChecksumTee`] so digests are
//! computed in a single pass.  The sink is single-producer and not
//! restartable: feed chunks in order, then call [`ChecksumTee::finalize`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest as _, Md5};

/// Streaming digest sink over object bytes.
pub struct ChecksumTee {
    crc: u32,
    md5: Md5,
    size: u64,
}

/// Digests of a finished byte stream, in the encodings the JSON API uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    /// CRC32C (Castagnoli), base64 over the big-endian u32.
    pub crc32c: String,
    /// MD5, base64.
    pub md5_hash: String,
    /// Total bytes seen.
    pub size: u64,
}

impl Digests {
    /// The HTTP entity tag: the quoted base64 MD5.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.md5_hash)
    }
}

impl ChecksumTee {
    pub fn new() -> Self {
        Self {
            crc: 0,
            md5: Md5::new(),
            size: 0,
        }
    }

    /// Feed the next chunk of the stream.
    pub fn update(&mut self, chunk: &[u8]) {
        self.crc = crc32c::crc32c_append(self.crc, chunk);
        self.md5.update(chunk);
        self.size += chunk.len() as u64;
    }

    /// Consume the sink and yield base64 digests of everything seen.
    pub fn finalize(self) -> Digests {
        Digests {
            crc32c: BASE64.encode(self.crc.to_be_bytes()),
            md5_hash: BASE64.encode(self.md5.finalize()),
            size: self.size,
        }
    }
}

impl Default for ChecksumTee {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest a complete in-memory buffer in one call.
pub fn digest(data: &[u8]) -> Digests {
    let mut tee = ChecksumTee::new();
    tee.update(data);
    tee.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream_digests() {
        let d = digest(b"");
        // CRC32C of "" is 0; MD5 of "" is d41d8cd98f00b204e9800998ecf8427e.
        assert_eq!(d.crc32c, "AAAAAA==");
        assert_eq!(d.md5_hash, "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(d.size, 0);
        assert_eq!(d.etag(), "\"1B2M2Y8AsgTpgAmY7PhCfg==\"");
    }

    #[test]
    fn chunked_matches_single_pass() {
        let mut tee = ChecksumTee::new();
        tee.update(b"HELLO");
        tee.update(b"WORLD");
        let chunked = tee.finalize();

        let whole = digest(b"HELLOWORLD");
        assert_eq!(chunked, whole);
        assert_eq!(chunked.size, 10);
    }

    #[test]
    fn known_crc32c_vector() {
        // RFC 3720 §B.4 test vector: 32 zero bytes.
        let d = digest(&[0u8; 32]);
        assert_eq!(
            BASE64.decode(&d.crc32c).unwrap(),
            0x8a9136aa_u32.to_be_bytes()
        );
    }

    #[test]
    fn md5_is_standard_base64() {
        // RFC 1321 test vector: MD5("abc") = 900150983cd24fb0d6963f7d28e17f72.
        let d = digest(b"abc");
        assert_eq!(
            hex_of(&BASE64.decode(&d.md5_hash).unwrap()),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    fn hex_of(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
