use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;

/// Log-friendly identifier attached to every request item.
///
/// Formatted as `<run>-<seq>`: `run` tags the process run (taken from the
/// wall clock at first use) and `seq` counts items within it, so ids from
/// several runs can be told apart in aggregated logs.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TraceId(Arc<str>);

impl TraceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TraceId {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

static RUN_TAG: OnceLock<u32> = OnceLock::new();
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn run_tag() -> u32 {
    *RUN_TAG.get_or_init(|| {
        // Millisecond clock folded into 32 bits
        let ms = Utc::now().timestamp_millis() as u64;
        (ms ^ (ms >> 32)) as u32
    })
}

/// Generates the id for the next request item.
pub(crate) fn next_trace_id() -> TraceId {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    TraceId(format!("{:08x}-{}", run_tag(), seq).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_trace_ids_are_unique() {
        let ids: HashSet<TraceId> = (0..1000).map(|_| next_trace_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_trace_id_format() {
        let first = next_trace_id();
        let second = next_trace_id();
        let (run, seq) = first.as_str().split_once('-').unwrap();
        assert_eq!(run.len(), 8);
        assert!(run.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(seq.parse::<u64>().is_ok());
        // Same run, later sequence number
        let (run2, seq2) = second.as_str().split_once('-').unwrap();
        assert_eq!(run, run2);
        assert!(seq2.parse::<u64>().unwrap() > seq.parse::<u64>().unwrap());
        assert_eq!(first.to_string(), first.as_str());
    }
}
