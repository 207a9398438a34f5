//! C2: frame-error registry (spec.md §4.2).
//!
//! A concurrent set of `(range, kind)` entries, written by the single
//! preprocessing thread and read by many request-handler workers. Backed by
//! a lock-striped `Vec` guarded by a `parking_lot::Mutex`: writes are rare
//! (one per anomaly observed on the ingest path) and reads are a linear
//! `any()` over a handful of live entries after a cleanup pass, so a plain
//! mutex outperforms anything fancier here.

use parking_lot::Mutex;

/// Kind of anomaly recorded against a timestamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameErrorKind {
    MissingFrames,
    Other(u16),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    begin: u64,
    end: u64,
    kind: FrameErrorKind,
}

#[derive(Debug, Default)]
pub struct FrameErrorRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl FrameErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an anomaly covering `[begin, end)`.
    pub fn insert(&self, begin: u64, end: u64, kind: FrameErrorKind) {
        self.entries.lock().push(Entry { begin, end, kind });
    }

    /// True if any live entry is of the given kind.
    pub fn has_error(&self, kind: FrameErrorKind) -> bool {
        self.entries.lock().iter().any(|e| e.kind == kind)
    }

    /// Drops every entry whose range ends before `ts` (spec.md §4.2), to be
    /// called by the request handler's cleanup protocol once the buffer's
    /// new oldest timestamp is known.
    pub fn remove_errors_until(&self, ts: u64) {
        self.entries.lock().retain(|e| e.end >= ts);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_query() {
        let reg = FrameErrorRegistry::new();
        assert!(!reg.has_error(FrameErrorKind::MissingFrames));
        reg.insert(100, 200, FrameErrorKind::MissingFrames);
        assert!(reg.has_error(FrameErrorKind::MissingFrames));
        assert!(!reg.has_error(FrameErrorKind::Other(7)));
    }

    #[test]
    fn remove_errors_until_drops_old_entries() {
        let reg = FrameErrorRegistry::new();
        reg.insert(0, 100, FrameErrorKind::MissingFrames);
        reg.insert(500, 600, FrameErrorKind::MissingFrames);
        reg.remove_errors_until(300);
        assert_eq!(reg.len(), 1);
        reg.remove_errors_until(1000);
        assert!(reg.is_empty());
    }
}
