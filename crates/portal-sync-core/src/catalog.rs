use time::macros::time;

use crate::models::{
    ChainTaskConfig, HistoryCleanupConfig, SyncMode, TaskConfig, TaskDefinition, TaskKind,
    TaskSchedule,
};

struct CatalogEntry {
    kind: TaskKind,
    name: &'static str,
    schedule: TaskSchedule,
    enabled: bool,
}

const DAY_MINUTES: u32 = 24 * 60;
const WEEK_MINUTES: u32 = 7 * DAY_MINUTES;

const CATALOG: [CatalogEntry; 7] = [
    CatalogEntry {
        kind: TaskKind::SyncUsers,
        name: "LMS user sync",
        schedule: TaskSchedule {
            interval_minutes: 240,
            schedule_day: None,
            schedule_time: None,
        },
        enabled: false,
    },
    CatalogEntry {
        kind: TaskKind::SyncGroups,
        name: "LMS group sync",
        schedule: TaskSchedule {
            interval_minutes: 240,
            schedule_day: None,
            schedule_time: None,
        },
        enabled: false,
    },
    CatalogEntry {
        kind: TaskKind::SyncCourses,
        name: "Course catalog sync",
        schedule: TaskSchedule {
            interval_minutes: DAY_MINUTES,
            schedule_day: None,
            schedule_time: None,
        },
        enabled: false,
    },
    CatalogEntry {
        kind: TaskKind::SyncEnrollments,
        name: "Enrollment sync",
        schedule: TaskSchedule {
            interval_minutes: 360,
            schedule_day: None,
            schedule_time: None,
        },
        enabled: false,
    },
    CatalogEntry {
        kind: TaskKind::PushCrm,
        name: "Partner CRM certification push",
        schedule: TaskSchedule {
            interval_minutes: DAY_MINUTES,
            schedule_day: None,
            schedule_time: None,
        },
        enabled: false,
    },
    CatalogEntry {
        kind: TaskKind::DailySyncChain,
        name: "Daily sync chain",
        schedule: TaskSchedule {
            interval_minutes: DAY_MINUTES,
            schedule_day: None,
            schedule_time: None,
        },
        enabled: true,
    },
    CatalogEntry {
        kind: TaskKind::HistoryCleanup,
        name: "Run history cleanup",
        schedule: TaskSchedule {
            interval_minutes: WEEK_MINUTES,
            schedule_day: Some(0),
            schedule_time: Some(time!(03:00:00)),
        },
        enabled: true,
    },
];

/// Definitions seeded into an empty store. Individual entity syncs start
/// disabled; the daily chain drives them.
pub fn default_task_definitions() -> Vec<TaskDefinition> {
    CATALOG
        .iter()
        .map(|entry| {
            let definition = TaskDefinition::new(entry.kind, entry.name, entry.schedule)
                .with_config(default_config(entry.kind));
            if entry.enabled {
                definition
            } else {
                definition.disabled()
            }
        })
        .collect()
}

fn default_config(kind: TaskKind) -> TaskConfig {
    match kind {
        TaskKind::DailySyncChain => TaskConfig::DailyChain(ChainTaskConfig {
            mode: SyncMode::Incremental,
        }),
        TaskKind::HistoryCleanup => TaskConfig::HistoryCleanup(HistoryCleanupConfig::default()),
        other => TaskConfig::default_for(other),
    }
}
