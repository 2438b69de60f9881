use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Incremental,
    Full,
}

/// Bounds of one sync run. `since` is only set for incremental windows.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct SyncWindow {
    pub mode: SyncMode,
    #[serde(with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
}

impl SyncWindow {
    pub fn full() -> Self {
        Self {
            mode: SyncMode::Full,
            since: None,
        }
    }

    pub fn incremental(since: OffsetDateTime) -> Self {
        Self {
            mode: SyncMode::Incremental,
            since: Some(since),
        }
    }

    pub fn is_full(&self) -> bool {
        self.mode == SyncMode::Full
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySyncConfig {
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmSyncType {
    Users,
    Groups,
    Certifications,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrmPushConfig {
    #[serde(default = "default_crm_sync_types")]
    pub sync_types: Vec<CrmSyncType>,
    #[serde(default)]
    pub mode: SyncMode,
}

impl Default for CrmPushConfig {
    fn default() -> Self {
        Self {
            sync_types: default_crm_sync_types(),
            mode: SyncMode::Incremental,
        }
    }
}

fn default_crm_sync_types() -> Vec<CrmSyncType> {
    vec![
        CrmSyncType::Users,
        CrmSyncType::Groups,
        CrmSyncType::Certifications,
    ]
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainTaskConfig {
    #[serde(default)]
    pub mode: SyncMode,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryCleanupConfig {
    #[serde(rename = "maxAgeDays", alias = "max_age_days", default = "default_max_age_days")]
    pub max_age_days: u32,
}

impl Default for HistoryCleanupConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

fn default_max_age_days() -> u32 {
    90
}

/// Typed per-kind configuration. Persisted as the bare JSON object of the
/// variant; the owning task kind selects the variant on the way back in.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskConfig {
    EntitySync(EntitySyncConfig),
    CrmPush(CrmPushConfig),
    DailyChain(ChainTaskConfig),
    HistoryCleanup(HistoryCleanupConfig),
}

impl TaskConfig {
    pub fn default_for(kind: TaskKind) -> Self {
        match kind {
            TaskKind::SyncUsers
            | TaskKind::SyncGroups
            | TaskKind::SyncCourses
            | TaskKind::SyncEnrollments => TaskConfig::EntitySync(EntitySyncConfig::default()),
            TaskKind::PushCrm => TaskConfig::CrmPush(CrmPushConfig::default()),
            TaskKind::DailySyncChain => TaskConfig::DailyChain(ChainTaskConfig::default()),
            TaskKind::HistoryCleanup => TaskConfig::HistoryCleanup(HistoryCleanupConfig::default()),
        }
    }

    /// Validates raw JSON against the config shape of `kind`. `null` and `{}`
    /// yield the kind's defaults.
    pub fn parse(kind: TaskKind, raw: &Value) -> CoreResult<Self> {
        if raw.is_null() {
            return Ok(Self::default_for(kind));
        }
        if !raw.is_object() {
            return Err(CoreError::for_task(
                kind,
                CoreErrorKind::InvalidInput,
                "task config must be a JSON object",
            ));
        }

        match kind {
            TaskKind::SyncUsers
            | TaskKind::SyncGroups
            | TaskKind::SyncCourses
            | TaskKind::SyncEnrollments => parse_variant(kind, raw).map(TaskConfig::EntitySync),
            TaskKind::PushCrm => {
                let config: CrmPushConfig = parse_variant(kind, raw)?;
                if config.sync_types.is_empty() {
                    return Err(CoreError::for_task(
                        kind,
                        CoreErrorKind::InvalidInput,
                        "sync_types must name at least one CRM sync type",
                    ));
                }
                Ok(TaskConfig::CrmPush(config))
            }
            TaskKind::DailySyncChain => parse_variant(kind, raw).map(TaskConfig::DailyChain),
            TaskKind::HistoryCleanup => {
                let config: HistoryCleanupConfig = parse_variant(kind, raw)?;
                if config.max_age_days == 0 {
                    return Err(CoreError::for_task(
                        kind,
                        CoreErrorKind::InvalidInput,
                        "maxAgeDays must be at least 1",
                    ));
                }
                Ok(TaskConfig::HistoryCleanup(config))
            }
        }
    }

    pub fn from_json_str(kind: TaskKind, raw: &str) -> CoreResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default_for(kind));
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|error| {
            CoreError::for_task(
                kind,
                CoreErrorKind::InvalidInput,
                format!("task config is not valid JSON: {error}"),
            )
        })?;
        Self::parse(kind, &value)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn sync_mode(&self) -> Option<SyncMode> {
        match self {
            TaskConfig::EntitySync(config) => Some(config.mode),
            TaskConfig::CrmPush(config) => Some(config.mode),
            TaskConfig::DailyChain(config) => Some(config.mode),
            TaskConfig::HistoryCleanup(_) => None,
        }
    }

    /// Whether `config` belongs to the shape family of `kind`.
    pub fn matches_kind(&self, kind: TaskKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(&Self::default_for(kind))
    }
}

fn parse_variant<T: DeserializeOwned>(kind: TaskKind, raw: &Value) -> CoreResult<T> {
    T::deserialize(raw).map_err(|error| {
        CoreError::for_task(
            kind,
            CoreErrorKind::InvalidInput,
            format!("invalid config for task '{kind}': {error}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CrmSyncType, SyncMode, TaskConfig};
    use crate::models::{CoreErrorKind, TaskKind};

    #[test]
    fn null_config_falls_back_to_kind_defaults() {
        let config = TaskConfig::parse(TaskKind::HistoryCleanup, &json!(null)).unwrap();
        let TaskConfig::HistoryCleanup(cleanup) = config else {
            panic!("expected history cleanup config");
        };
        assert_eq!(cleanup.max_age_days, 90);
    }

    #[test]
    fn crm_config_accepts_sync_types_and_mode() {
        let config = TaskConfig::parse(
            TaskKind::PushCrm,
            &json!({"sync_types": ["users", "certifications"], "mode": "full"}),
        )
        .unwrap();
        let TaskConfig::CrmPush(crm) = config else {
            panic!("expected crm config");
        };
        assert_eq!(
            crm.sync_types,
            vec![CrmSyncType::Users, CrmSyncType::Certifications]
        );
        assert_eq!(crm.mode, SyncMode::Full);
    }

    #[test]
    fn unknown_fields_are_rejected_at_the_boundary() {
        let error = TaskConfig::parse(TaskKind::SyncUsers, &json!({"mode": "full", "bogus": 1}))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(error.task, Some(TaskKind::SyncUsers));
    }

    #[test]
    fn camel_case_max_age_round_trips_through_storage_text() {
        let config =
            TaskConfig::parse(TaskKind::HistoryCleanup, &json!({"maxAgeDays": 14})).unwrap();
        let stored = config.to_json_string();
        assert_eq!(stored, r#"{"maxAgeDays":14}"#);
        assert_eq!(
            TaskConfig::from_json_str(TaskKind::HistoryCleanup, &stored).unwrap(),
            config
        );
    }

    #[test]
    fn non_object_config_is_rejected() {
        let error = TaskConfig::parse(TaskKind::SyncCourses, &json!([1, 2])).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }
}
