// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Server signing identity: ECDSA P-256 host key and fingerprints.
//!
//! A key may be deterministically derived from a seed string so that a
//! server restarted with the same `--key` presents the same identity. The
//! seed is strengthened by iterated SHA-512 and then drives rejection
//! sampling of the private scalar.

use md5::{Digest as _, Md5};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use sha2::Sha512;

use super::TunnelError;

/// Number of times a seed is hashed with SHA-512 to produce the starting
/// state of the pseudo-random stream.
const DETERM_RAND_ITER: usize = 2048;

/// Deterministic pseudo-random byte stream: half of each SHA-512 output is
/// chained as state, the other half is emitted.
struct DetermRand {
  next: [u8; 32],
  out: [u8; 32],
  used: usize,
}

fn hash_split(input: &[u8]) -> ([u8; 32], [u8; 32]) {
  let digest = Sha512::digest(input);
  let mut next = [0u8; 32];
  let mut out = [0u8; 32];
  next.copy_from_slice(&digest[..32]);
  out.copy_from_slice(&digest[32..]);
  (next, out)
}

impl DetermRand {
  fn new(seed: &[u8]) -> Self {
    let mut next: Vec<u8> = seed.to_vec();
    let mut out = [0u8; 32];
    for _ in 0..DETERM_RAND_ITER {
      let (n, o) = hash_split(&next);
      next = n.to_vec();
      out = o;
    }
    let mut fixed = [0u8; 32];
    fixed.copy_from_slice(&next);
    Self {
      next: fixed,
      out,
      used: 0,
    }
  }

  fn fill(&mut self, buf: &mut [u8]) {
    let mut n = 0;
    while n < buf.len() {
      if self.used >= self.out.len() {
        let (next, out) = hash_split(&self.next);
        self.next = next;
        self.out = out;
        self.used = 0;
      }
      let take = (buf.len() - n).min(self.out.len() - self.used);
      buf[n..n + take].copy_from_slice(&self.out[self.used..self.used + take]);
      self.used += take;
      n += take;
    }
  }
}

/// Generates the server host keypair. An empty seed produces a random key;
/// otherwise the key is a pure function of the seed.
pub fn generate_key(seed: &str) -> Result<KeyPair, TunnelError> {
  let signing = if seed.is_empty() {
    p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)
  } else {
    let mut stream = DetermRand::new(seed.as_bytes());
    let mut candidate = [0u8; 32];
    loop {
      stream.fill(&mut candidate);
      // from_slice rejects zero and out-of-range scalars; draw again.
      if let Ok(key) = p256::ecdsa::SigningKey::from_slice(&candidate) {
        break key;
      }
    }
  };
  Ok(KeyPair::EC {
    key: russh_keys::ec::PrivateKey::P256(signing),
  })
}

/// Lowercase colon-separated MD5 fingerprint of an SSH public key, e.g.
/// `ab:12:34:…`, matching what the server logs at startup.
pub fn fingerprint(key: &PublicKey) -> String {
  let digest = Md5::digest(key.public_key_bytes());
  digest
    .iter()
    .map(|b| format!("{:02x}", b))
    .collect::<Vec<_>>()
    .join(":")
}

/// Fingerprint of a keypair's public half.
pub fn keypair_fingerprint(key: &KeyPair) -> Result<String, TunnelError> {
  let public = key
    .clone_public_key()
    .map_err(|e| TunnelError::Internal(format!("Unable to derive public key: {}", e)))?;
  Ok(fingerprint(&public))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn seeded_keys_are_deterministic() {
    let a = generate_key("test seed").unwrap();
    let b = generate_key("test seed").unwrap();
    assert_eq!(
      keypair_fingerprint(&a).unwrap(),
      keypair_fingerprint(&b).unwrap()
    );
  }

  #[test]
  fn different_seeds_differ() {
    let a = generate_key("seed one").unwrap();
    let b = generate_key("seed two").unwrap();
    assert_ne!(
      keypair_fingerprint(&a).unwrap(),
      keypair_fingerprint(&b).unwrap()
    );
  }

  #[test]
  fn fingerprint_is_colon_separated_md5() {
    let key = generate_key("fingerprint form").unwrap();
    let fp = keypair_fingerprint(&key).unwrap();
    let parts: Vec<&str> = fp.split(':').collect();
    assert_eq!(parts.len(), 16);
    assert!(parts
      .iter()
      .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit())));
    assert_eq!(fp, fp.to_lowercase());
  }

  #[test]
  fn determ_rand_is_reproducible() {
    let mut a = DetermRand::new(b"seed");
    let mut b = DetermRand::new(b"seed");
    let mut buf_a = [0u8; 100];
    let mut buf_b = [0u8; 100];
    a.fill(&mut buf_a);
    b.fill(&mut buf_b);
    assert_eq!(buf_a, buf_b);
    let mut c = DetermRand::new(b"other");
    let mut buf_c = [0u8; 100];
    c.fill(&mut buf_c);
    assert_ne!(buf_a, buf_c);
  }
}
