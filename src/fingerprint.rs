use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Scheme tag prefixed to every fingerprint so the encoding can evolve.
pub const FINGERPRINT_TAG: &str = "SHA1";

/// Content fingerprint: `"SHA1" + base64(u32be(size) ++ sha1(bytes))`.
/// Deterministic and stable across recomputation; not hardened against
/// adversarial collisions.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    encode(bytes.len() as u64, hasher)
}

/// Same fingerprint, computed by streaming the file.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(encode(size, hasher))
}

fn encode(size: u64, hasher: Sha1) -> String {
    let digest = hasher.finalize();
    let mut raw = Vec::with_capacity(4 + digest.len());
    // Sizes are folded into 32 bits; anything larger wraps, which only
    // weakens the key for multi-gigabyte files the probe check still covers.
    raw.extend_from_slice(&(size as u32).to_be_bytes());
    raw.extend_from_slice(&digest);
    format!("{}{}", FINGERPRINT_TAG, BASE64.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stable_across_recomputation() {
        let data = vec![7u8; 4096];
        assert_eq!(fingerprint(&data), fingerprint(&data));
        assert!(fingerprint(&data).starts_with(FINGERPRINT_TAG));
    }

    #[test]
    fn single_byte_mutation_changes_the_fingerprint() {
        let mut data = vec![0u8; 8192];
        let original = fingerprint(&data);
        data[5000] ^= 1;
        assert_ne!(fingerprint(&data), original);
    }

    #[test]
    fn file_and_memory_agree() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        assert_eq!(fingerprint_file(tmp.path()).unwrap(), fingerprint(&data));
    }

    #[test]
    fn size_is_part_of_the_key() {
        // Same leading bytes, different length.
        let a = fingerprint(&[0u8; 16]);
        let b = fingerprint(&[0u8; 17]);
        assert_ne!(a, b);
    }
}
