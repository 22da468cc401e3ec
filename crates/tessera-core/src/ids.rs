use facet::Facet;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn process_prefix_u16() -> u16 {
    static PROCESS_PREFIX: OnceLock<u16> = OnceLock::new();
    *PROCESS_PREFIX.get_or_init(|| {
        let pid = std::process::id() as u64;
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        ((seed ^ pid) & 0xFFFF) as u16
    })
}

/// Monotonic counter bit-packed with a process prefix so ids never collide
/// or get reused across a process lifetime, even once formatted for the wire.
fn next_opaque_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let prefix = process_prefix_u16();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x0000_FFFF_FFFF_FFFF;
    let raw = ((prefix as u64) << 48) | counter;
    TesseraHex(raw).to_string()
}

/// Lowercase-hex formatter with `a..f` remapped to `p,e,s,P,E,S` so ids read
/// as pronounceable tokens rather than raw hex.
struct TesseraHex(u64);

impl fmt::Display for TesseraHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DIGITS: &[u8; 16] = b"0123456789pesPES";
        let mut out = [0u8; 16];
        for (idx, shift) in (0..16).zip((0..64).step_by(4).rev()) {
            let nibble = ((self.0 >> shift) & 0xF) as usize;
            out[idx] = DIGITS[nibble];
        }
        // SAFETY: DIGITS only contains ASCII bytes.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&out) })
    }
}

/// Process-local identity of a `Subject`. Never reused; the registry's
/// bijection invariant depends on that.
#[derive(Facet, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct SubjectId(pub(crate) String);

impl SubjectId {
    pub fn new() -> Self {
        Self(next_opaque_id())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject:{}", self.0)
    }
}

/// The remote system's name for a subject (e.g. an OPC UA node-id), as an
/// opaque string from the core's point of view.
#[derive(Facet, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a single connector instance. Used as the "source" token for
/// every mutation that connector performs, and as the loop-suppression key.
#[derive(Facet, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct ConnectorId(pub(crate) String);

impl ConnectorId {
    pub fn new() -> Self {
        Self(next_opaque_id())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for ConnectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_ids_are_unique_within_a_process() {
        let a = SubjectId::new();
        let b = SubjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn hex_alphabet_never_emits_plain_a_through_f() {
        let id = SubjectId::new();
        assert!(!id.as_str().contains(['a', 'b', 'c', 'd', 'f']));
    }
}
