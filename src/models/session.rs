use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub app_version: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_screen: Option<String>,
}

impl SessionInfo {
    pub fn begin(app_version: &str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            app_version: app_version.to_string(),
            platform: std::env::consts::OS.to_string(),
            current_screen: None,
        }
    }
}

/// Live session state shared between the observer and the crash hooks.
pub struct SessionTracker {
    info: RwLock<SessionInfo>,
}

impl SessionTracker {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info: RwLock::new(info),
        }
    }

    pub fn snapshot(&self) -> SessionInfo {
        match self.info.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn current_screen(&self) -> Option<String> {
        self.snapshot().current_screen
    }

    pub fn set_screen(&self, name: &str) {
        let mut guard = match self.info.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.current_screen = Some(name.to_string());
    }
}
