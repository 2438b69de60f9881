use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskProgress {
    pub stage: String,
    pub current: u64,
    pub total: u64,
    pub details: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TaskProgress {
    pub fn starting(at: OffsetDateTime) -> Self {
        Self {
            stage: "starting".to_string(),
            current: 0,
            total: 0,
            details: None,
            updated_at: at,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.current.min(self.total) as f64 / self.total as f64) * 100.0)
    }
}
