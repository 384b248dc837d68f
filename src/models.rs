use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role carried in the bearer token. Only speakers and admins may publish
/// media into a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Speaker,
    Admin,
    Audience,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Speaker => "speaker",
            Role::Admin => "admin",
            Role::Audience => "audience",
        }
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, Role::Speaker | Role::Admin)
    }

    pub fn can_operate(&self) -> bool {
        self.can_publish()
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "speaker" => Ok(Role::Speaker),
            "admin" => Ok(Role::Admin),
            "audience" => Ok(Role::Audience),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recording lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Recording,
    Processing,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Recording => "recording",
            RecordingStatus::Processing => "processing",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A webinar recording row (internal tap or external provider → object storage).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Recording {
    pub id: Uuid,
    pub webinar_id: Uuid,
    pub provider_recording_id: Option<String>,
    pub original_url: Option<String>,
    pub s3_url: Option<String>,
    pub s3_key: Option<String>,
    pub duration: i32,
    pub file_size: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One live-stream session per webinar; at most one row without `ended_at`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StreamSession {
    pub id: Uuid,
    pub webinar_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub peak_viewers: i32,
    pub total_viewers: i32,
    pub total_watch_time: i64,
    pub poll_participation_count: i32,
    pub questions_count: i32,
}

/// One row per client join; closed with `left_at` and `watch_seconds` on leave.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionLog {
    pub id: Uuid,
    pub webinar_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub watch_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for role in [Role::Speaker, Role::Admin, Role::Audience] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("viewer".parse::<Role>().is_err());
    }

    #[test]
    fn publish_permissions() {
        assert!(Role::Speaker.can_publish());
        assert!(Role::Admin.can_publish());
        assert!(!Role::Audience.can_publish());
    }
}
