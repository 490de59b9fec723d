//! The seam between the install state machine and the platform installer.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

pub type SessionId = i32;

/// Status codes carried by the platform's install result broadcast.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum InstallStatus {
    PendingUserAction,
    Success,
    Failure,
    Blocked,
    Aborted,
    Invalid,
    Conflict,
    Storage,
    Incompatible,
    Timeout,
    Unknown(i32),
}

impl InstallStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => Self::PendingUserAction,
            0 => Self::Success,
            1 => Self::Failure,
            2 => Self::Blocked,
            3 => Self::Aborted,
            4 => Self::Invalid,
            5 => Self::Conflict,
            6 => Self::Storage,
            7 => Self::Incompatible,
            8 => Self::Timeout,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::PendingUserAction => -1,
            Self::Success => 0,
            Self::Failure => 1,
            Self::Blocked => 2,
            Self::Aborted => 3,
            Self::Invalid => 4,
            Self::Conflict => 5,
            Self::Storage => 6,
            Self::Incompatible => 7,
            Self::Timeout => 8,
            Self::Unknown(code) => code,
        }
    }
}

/// One asynchronous report about a committed session.
#[derive(Clone, Debug)]
pub struct InstallNotification<I> {
    pub session_id: SessionId,
    pub status: InstallStatus,
    pub message: Option<String>,
    /// Confirmation screen to show when the status asks for user action.
    pub confirmation: Option<I>,
}

/// Platform installer operations the state machine drives.
#[cfg_attr(test, mockall::automock(type Intent = String;))]
pub trait InstallPlatform {
    /// Handle to a launchable confirmation screen.
    type Intent;

    /// Whether this app may install packages from unknown sources.
    fn can_request_installs(&self) -> Result<bool>;

    /// Sends the user to the settings page that grants the permission.
    fn open_unknown_sources_settings(&self) -> Result<()>;

    /// Opens a full-install session.
    fn create_session(&self) -> Result<SessionId>;

    /// Streams `len` bytes of `artifact` into the session as `name` and syncs them.
    fn write_session(&self, session: SessionId, name: &str, artifact: &Path, len: u64) -> Result<()>;

    /// Commits the session; the result arrives later as a notification.
    fn commit_session(&self, session: SessionId) -> Result<()>;

    fn abandon_session(&self, session: SessionId) -> Result<()>;

    fn launch(&self, intent: Self::Intent) -> Result<()>;

    /// Hands the artifact to the platform's generic package viewer.
    fn view_package(&self, artifact: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_map_status_codes() {
        for code in -1..=8 {
            assert_eq!(InstallStatus::from_code(code).code(), code);
        }
        assert_eq!(InstallStatus::from_code(-1), InstallStatus::PendingUserAction);
        assert_eq!(InstallStatus::from_code(42), InstallStatus::Unknown(42));
    }
}
