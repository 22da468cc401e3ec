use facet::Facet;
use std::sync::OnceLock;
use std::time::Instant;

/// "Process birth" is defined as the first call to `Timestamp::now()`.
fn anchor() -> &'static Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now)
}

/// A changed-timestamp or received-timestamp.
///
/// Tri-state rather than `Option<u64>`: a write can carry no timestamp
/// information at all (`Unset`, meaning "use the clock"), an explicit
/// timestamp, or an explicit absence of one reported by the source
/// (`ExplicitNull`, meaning "the source had no timestamp for this write" --
/// distinct from "unset").
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Timestamp {
    Unset,
    ExplicitNull,
    At(TimestampMillis),
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::At(TimestampMillis::now())
    }

    pub fn resolve_or_clock(self) -> TimestampMillis {
        match self {
            Timestamp::At(t) => t,
            Timestamp::Unset | Timestamp::ExplicitNull => TimestampMillis::now(),
        }
    }
}

/// Monotonic, process-relative millisecond timestamp.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct TimestampMillis(u64);

impl TimestampMillis {
    pub fn now() -> Self {
        let elapsed_ms = anchor().elapsed().as_millis().min(u64::MAX as u128) as u64;
        Self(elapsed_ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = TimestampMillis::now();
        let b = TimestampMillis::now();
        assert!(b >= a);
    }

    #[test]
    fn unset_and_explicit_null_both_resolve_to_clock() {
        let before = TimestampMillis::now();
        let resolved_unset = Timestamp::Unset.resolve_or_clock();
        let resolved_null = Timestamp::ExplicitNull.resolve_or_clock();
        assert!(resolved_unset >= before);
        assert!(resolved_null >= before);
    }

    #[test]
    fn at_resolves_to_itself() {
        let t = TimestampMillis::now();
        assert_eq!(Timestamp::At(t).resolve_or_clock(), t);
    }
}
