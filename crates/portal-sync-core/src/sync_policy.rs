use time::{Duration, OffsetDateTime};

use crate::models::{SyncMode, SyncWindow};

/// Picks the sync window for a run. Incremental runs need a watermark no
/// older than `max_incremental_age`; anything else degrades to a full sync.
pub fn resolve_sync_window(
    requested: SyncMode,
    watermark: Option<OffsetDateTime>,
    now: OffsetDateTime,
    max_incremental_age: Duration,
) -> SyncWindow {
    match (requested, watermark) {
        (SyncMode::Full, _) | (SyncMode::Incremental, None) => SyncWindow::full(),
        (SyncMode::Incremental, Some(since)) if now - since > max_incremental_age => {
            SyncWindow::full()
        }
        (SyncMode::Incremental, Some(since)) => SyncWindow::incremental(since),
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use time::macros::datetime;

    use super::resolve_sync_window;
    use crate::models::{SyncMode, SyncWindow};

    #[test]
    fn incremental_without_watermark_runs_full() {
        let now = datetime!(2024-05-01 06:00:00 UTC);
        let window = resolve_sync_window(SyncMode::Incremental, None, now, Duration::days(7));
        assert_eq!(window, SyncWindow::full());
    }

    #[test]
    fn incremental_with_recent_watermark_uses_it() {
        let now = datetime!(2024-05-01 06:00:00 UTC);
        let since = datetime!(2024-04-30 06:00:00 UTC);
        let window =
            resolve_sync_window(SyncMode::Incremental, Some(since), now, Duration::days(7));
        assert_eq!(window, SyncWindow::incremental(since));
    }

    #[test]
    fn stale_watermark_forces_full_sync() {
        let now = datetime!(2024-05-01 06:00:00 UTC);
        let since = datetime!(2024-04-01 06:00:00 UTC);
        let window =
            resolve_sync_window(SyncMode::Incremental, Some(since), now, Duration::days(7));
        assert!(window.is_full());
    }

    #[test]
    fn full_mode_ignores_watermark() {
        let now = datetime!(2024-05-01 06:00:00 UTC);
        let since = datetime!(2024-04-30 23:00:00 UTC);
        let window = resolve_sync_window(SyncMode::Full, Some(since), now, Duration::days(7));
        assert_eq!(window.since, None);
    }
}
