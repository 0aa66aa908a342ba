//! Coarse device fingerprint for session records.
//!
//! The fingerprint is a weak anti-hijacking signal: a session record copied
//! to a different machine should fail to re-enter. It is not a security
//! boundary, and environments that cannot report every attribute are
//! tolerated rather than locked out, as long as every attribute both sides
//! report still agrees.

use blake2::digest::consts::{U16, U8};
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

/// Fingerprint hash length.
pub const FINGERPRINT_LEN: usize = 16;

/// Number of profile attributes.
pub const ATTRIBUTE_COUNT: usize = 6;

/// Per-attribute digest length.
pub const ATTRIBUTE_DIGEST_LEN: usize = 8;

/// Fewest attributes both sides must report for a degraded match.
pub const MIN_DEGRADED_ATTRIBUTES: usize = 2;

const FINGERPRINT_DOMAIN: &[u8] = b"memvault-device-v1";
const ATTRIBUTE_DOMAIN: &[u8] = b"memvault-device-attr-v1";

/// Stable, low-resolution environment attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub os: Option<String>,
    pub arch: Option<String>,
    pub family: Option<String>,
    pub cpu_count: Option<usize>,
    pub hostname: Option<String>,
    pub locale: Option<String>,
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

impl DeviceProfile {
    fn attributes(&self) -> [(&'static str, Option<String>); ATTRIBUTE_COUNT] {
        [
            ("os", self.os.clone()),
            ("arch", self.arch.clone()),
            ("family", self.family.clone()),
            ("cpus", self.cpu_count.map(|n| n.to_string())),
            ("host", self.hostname.clone()),
            ("locale", self.locale.clone()),
        ]
    }

    /// Number of attributes present.
    pub fn present_count(&self) -> usize {
        self.attributes().iter().filter(|(_, v)| v.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.present_count() == ATTRIBUTE_COUNT
    }

    /// Hash of the profile. Missing attributes hash as a fixed marker.
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        let mut hasher = Blake2b::<U16>::new();
        hasher.update(FINGERPRINT_DOMAIN);
        for (name, value) in self.attributes() {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            match value {
                Some(v) => hasher.update(normalize(&v).as_bytes()),
                None => hasher.update(b"\x00absent"),
            }
            hasher.update(b";");
        }

        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// One short digest per present attribute, used for degraded comparison.
    pub fn attribute_digests(&self) -> AttributeDigests {
        let mut digests = AttributeDigests {
            present: 0,
            digests: [0u8; ATTRIBUTE_DIGEST_LEN * ATTRIBUTE_COUNT],
        };

        for (index, (name, value)) in self.attributes().into_iter().enumerate() {
            let Some(value) = value else {
                continue;
            };
            let mut hasher = Blake2b::<U8>::new();
            hasher.update(ATTRIBUTE_DOMAIN);
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(normalize(&value).as_bytes());

            digests.present |= 1 << index;
            digests.slot_mut(index).copy_from_slice(&hasher.finalize());
        }
        digests
    }
}

/// Per-attribute digests with a presence mask, bit `i` for attribute `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDigests {
    pub present: u8,
    #[serde(with = "memvault_crypto::encoding::b64_array")]
    pub digests: [u8; ATTRIBUTE_DIGEST_LEN * ATTRIBUTE_COUNT],
}

impl AttributeDigests {
    fn has(&self, index: usize) -> bool {
        self.present & (1 << index) != 0
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.digests[index * ATTRIBUTE_DIGEST_LEN..(index + 1) * ATTRIBUTE_DIGEST_LEN]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.digests[index * ATTRIBUTE_DIGEST_LEN..(index + 1) * ATTRIBUTE_DIGEST_LEN]
    }
}

/// Source of the current environment's profile.
pub trait EnvironmentProbe: Send + Sync {
    fn profile(&self) -> DeviceProfile;
}

/// Reads the profile of the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl EnvironmentProbe for HostProbe {
    fn profile(&self) -> DeviceProfile {
        let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };

        DeviceProfile {
            os: non_empty(std::env::consts::OS.to_string()),
            arch: non_empty(std::env::consts::ARCH.to_string()),
            family: non_empty(std::env::consts::FAMILY.to_string()),
            cpu_count: std::thread::available_parallelism().ok().map(|n| n.get()),
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string())
                .and_then(non_empty),
            locale: std::env::var("LANG").ok().and_then(non_empty),
        }
    }
}

/// Fixed profile, for tests and embedders that supply their own attributes.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub DeviceProfile);

impl EnvironmentProbe for StaticProbe {
    fn profile(&self) -> DeviceProfile {
        self.0.clone()
    }
}

/// Outcome of comparing a stored fingerprint with the current environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintCheck {
    /// Hashes are equal.
    Match,
    /// Hashes differ because the current environment is missing
    /// attributes, and every attribute both sides report agrees.
    Degraded,
    /// Any reported attribute differs, the overlap is too small, or the
    /// stored value is implausible.
    Mismatch,
}

/// Compare a stored fingerprint against `current`.
///
/// Without stored attribute digests the comparison is all-or-nothing.
pub fn check_fingerprint(
    stored: &[u8; FINGERPRINT_LEN],
    stored_attributes: Option<&AttributeDigests>,
    current: &DeviceProfile,
) -> FingerprintCheck {
    use subtle::ConstantTimeEq;

    if stored.iter().all(|b| *b == 0) {
        return FingerprintCheck::Mismatch;
    }

    if bool::from(stored[..].ct_eq(&current.fingerprint()[..])) {
        return FingerprintCheck::Match;
    }

    let Some(stored_attributes) = stored_attributes else {
        return FingerprintCheck::Mismatch;
    };
    let observed = current.attribute_digests();
    let mut shared = 0;
    for index in 0..ATTRIBUTE_COUNT {
        if !(stored_attributes.has(index) && observed.has(index)) {
            continue;
        }
        if !bool::from(stored_attributes.slot(index).ct_eq(observed.slot(index))) {
            return FingerprintCheck::Mismatch;
        }
        shared += 1;
    }

    if shared >= MIN_DEGRADED_ATTRIBUTES {
        FingerprintCheck::Degraded
    } else {
        FingerprintCheck::Mismatch
    }
}
