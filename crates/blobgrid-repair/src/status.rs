//! Download bookkeeping
//!
//! One recovery downloads each volume unit at most once: retrying a
//! replica against the same bid set cannot produce new data, and repair
//! targets must never be read at all. Both rules live here, keyed by
//! `Vuid` so they hold across phases and stripes.

use blobgrid_common::Vuid;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
struct StatusInner {
    downloaded: HashSet<Vuid>,
    forbidden: HashSet<Vuid>,
}

/// Tracks which volume units may still be downloaded
#[derive(Default)]
pub(crate) struct DownloadStatus {
    inner: Mutex<StatusInner>,
}

impl DownloadStatus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True when the unit is neither forbidden nor already attempted
    pub(crate) fn need_download(&self, vuid: Vuid) -> bool {
        let inner = self.inner.lock();
        !inner.forbidden.contains(&vuid) && !inner.downloaded.contains(&vuid)
    }

    /// Never download this unit (it is a repair target)
    pub(crate) fn forbid(&self, vuid: Vuid) {
        self.inner.lock().forbidden.insert(vuid);
    }

    /// Record that a download of this unit was attempted
    pub(crate) fn mark_downloaded(&self, vuid: Vuid) {
        self.inner.lock().downloaded.insert(vuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vuid(idx: u8) -> Vuid {
        Vuid::new(1, idx, 1)
    }

    #[test]
    fn test_fresh_unit_needs_download() {
        let status = DownloadStatus::new();
        assert!(status.need_download(vuid(0)));
    }

    #[test]
    fn test_downloaded_unit_is_not_retried() {
        let status = DownloadStatus::new();
        status.mark_downloaded(vuid(3));
        assert!(!status.need_download(vuid(3)));
        assert!(status.need_download(vuid(4)));
    }

    #[test]
    fn test_forbidden_wins_over_everything() {
        let status = DownloadStatus::new();
        status.forbid(vuid(7));
        assert!(!status.need_download(vuid(7)));

        // Marking downloaded afterwards changes nothing.
        status.mark_downloaded(vuid(7));
        assert!(!status.need_download(vuid(7)));
    }
}
