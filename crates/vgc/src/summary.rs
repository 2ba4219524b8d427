//! Point-in-time memory accounting.

use serde::Serialize;

/// Snapshot of the arena's memory usage.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    /// When the snapshot was taken.
    pub taken_at: chrono::DateTime<chrono::Utc>,
    /// Bytes handed out from the dynamic space since the last cycle.
    pub allocated: usize,
    /// Bytes of committed dynamic space.
    pub committed: usize,
    /// Bytes committed for non-moving static allocations.
    pub static_bytes: usize,
    /// Objects currently registered for finalization.
    pub finalizable: usize,
    /// Finalizations queued but not yet run.
    pub pending_finalizers: usize,
    /// Collections completed so far.
    pub collections: u64,
    /// Registered roots.
    pub roots: usize,
}

impl MemorySummary {
    /// Serialize for log sinks and diagnostics endpoints.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip_fields() {
        let s = MemorySummary {
            taken_at: chrono::Utc::now(),
            allocated: 10,
            committed: 20,
            static_bytes: 5,
            finalizable: 1,
            pending_finalizers: 0,
            collections: 3,
            roots: 2,
        };
        let json = s.to_json();
        assert!(json.contains("\"allocated\":10"));
        assert!(json.contains("\"collections\":3"));
    }
}
