//! Install state machine.
//!
//! `install` opens a session, streams the artifact into it, commits and
//! returns at once. The platform reports back later through
//! [`InstallNotification`]s which are fed to [`Installer::on_notification`],
//! either inline or by a thread started with [`Installer::run_events`].
//! Every tracked install resolves its [`InstallHandle`] exactly once.

pub mod platform;

pub use platform::{InstallNotification, InstallPlatform, InstallStatus, SessionId};

use crate::core::error::InstallError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How many installs are tracked at once.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackingPolicy {
    /// Starting an install supersedes whatever was tracked before.
    #[default]
    LatestOnly,
    /// Every committed session is tracked until it resolves.
    PerSession,
}

/// State of a tracked session. Sessions that are not tracked have none.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum InstallState {
    /// Written and registered, commit not yet returned.
    SessionOpen,
    AwaitingPlatformCallback,
    UserActionRequested,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum InstallOutcome {
    Succeeded,
    /// The platform refused; `fallback_launched` tells whether the generic
    /// package viewer was started instead.
    Failed {
        status: InstallStatus,
        message: Option<String>,
        fallback_launched: bool,
    },
    /// A newer install took over tracking. The platform session itself may
    /// still complete.
    Superseded,
    Cancelled,
    /// No notification arrived before `expire_older_than` gave up on it.
    Expired,
}

/// Result of starting an install.
#[derive(Debug)]
pub enum InstallStart {
    /// Installing from unknown sources is not allowed yet. The settings page
    /// was opened and no session exists.
    NeedsPermission,
    Started(InstallHandle),
}

/// Receives the single outcome of one tracked install.
#[derive(Debug)]
pub struct InstallHandle {
    session_id: SessionId,
    receiver: Receiver<InstallOutcome>,
    timeout: Option<Duration>,
}

impl InstallHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Blocks until the install resolves, bounded by the configured timeout if any.
    pub fn wait(self) -> Result<InstallOutcome, InstallError> {
        match self.timeout {
            Some(timeout) => self.wait_timeout(timeout),
            None => self.receiver.recv().map_err(|_| InstallError::Cancelled),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<InstallOutcome, InstallError> {
        self.receiver.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => InstallError::TimedOut(timeout),
            RecvTimeoutError::Disconnected => InstallError::Cancelled,
        })
    }

    pub fn try_outcome(&self) -> Option<InstallOutcome> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
struct Tracked {
    artifact: PathBuf,
    state: InstallState,
    started: Instant,
    sender: Sender<InstallOutcome>,
}

impl Tracked {
    fn resolve(self, session: SessionId, outcome: InstallOutcome) {
        tracing::debug!("install session {} resolved: {:?}", session, outcome);
        // the handle may already be gone
        let _ = self.sender.send(outcome);
    }
}

#[derive(Clone, Debug)]
pub struct InstallerOptions {
    pub tracking: TrackingPolicy,
    /// Name of the single entry written into a session.
    pub session_entry: String,
    /// Default bound for [`InstallHandle::wait`].
    pub timeout: Option<Duration>,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            tracking: TrackingPolicy::LatestOnly,
            session_entry: "app".to_string(),
            timeout: None,
        }
    }
}

impl From<&crate::core::config::InstallSettings> for InstallerOptions {
    fn from(settings: &crate::core::config::InstallSettings) -> Self {
        Self {
            tracking: settings.tracking,
            session_entry: settings.session_entry.clone(),
            timeout: settings.timeout(),
        }
    }
}

pub struct Installer<P: InstallPlatform> {
    platform: P,
    options: InstallerOptions,
    registry: Mutex<HashMap<SessionId, Tracked>>,
}

impl<P: InstallPlatform> Installer<P> {
    pub fn new(platform: P, options: InstallerOptions) -> Self {
        Self {
            platform,
            options,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SessionId, Tracked>> {
        // a panic while holding the lock leaves the map itself consistent
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state of a tracked session, `None` once it resolved.
    pub fn state(&self, session: SessionId) -> Option<InstallState> {
        self.registry().get(&session).map(|t| t.state)
    }

    pub fn tracked_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.registry().keys().copied().collect();
        sessions.sort_unstable();
        sessions
    }

    /// Starts installing `artifact`. Returns once the session is committed.
    pub fn install(&self, artifact: &Path) -> Result<InstallStart, InstallError> {
        let len = std::fs::metadata(artifact)?.len();
        let allowed = self
            .platform
            .can_request_installs()
            .map_err(InstallError::platform)?;
        if !allowed {
            tracing::info!("Install from unknown sources not allowed, opening settings");
            self.platform
                .open_unknown_sources_settings()
                .map_err(InstallError::platform)?;
            return Ok(InstallStart::NeedsPermission);
        }

        let session = self
            .platform
            .create_session()
            .map_err(InstallError::platform)?;
        tracing::info!("Install session {} open ({} bytes)", session, len);
        if let Err(err) =
            self.platform
                .write_session(session, &self.options.session_entry, artifact, len)
        {
            self.abandon(session);
            return Err(InstallError::platform(err));
        }

        let (sender, receiver) = mpsc::channel();
        {
            let mut registry = self.registry();
            if self.options.tracking == TrackingPolicy::LatestOnly {
                for (previous, tracked) in registry.drain() {
                    tracing::info!("Install session {} superseded by {}", previous, session);
                    tracked.resolve(previous, InstallOutcome::Superseded);
                }
            }
            registry.insert(
                session,
                Tracked {
                    artifact: artifact.to_path_buf(),
                    state: InstallState::SessionOpen,
                    started: Instant::now(),
                    sender,
                },
            );
        }

        if let Err(err) = self.platform.commit_session(session) {
            self.registry().remove(&session);
            self.abandon(session);
            return Err(InstallError::platform(err));
        }
        if let Some(tracked) = self.registry().get_mut(&session) {
            // a notification may have arrived while committing
            if tracked.state == InstallState::SessionOpen {
                tracked.state = InstallState::AwaitingPlatformCallback;
            }
        }
        tracing::info!("Install session {} committed, awaiting platform", session);
        Ok(InstallStart::Started(InstallHandle {
            session_id: session,
            receiver,
            timeout: self.options.timeout,
        }))
    }

    fn abandon(&self, session: SessionId) {
        if let Err(err) = self.platform.abandon_session(session) {
            tracing::warn!("Failed to abandon install session {}: {:#}", session, err);
        }
    }

    /// Applies one platform notification.
    pub fn on_notification(&self, notification: InstallNotification<P::Intent>) {
        let InstallNotification {
            session_id,
            status,
            message,
            confirmation,
        } = notification;

        if status == InstallStatus::PendingUserAction {
            match self.registry().get_mut(&session_id) {
                Some(tracked) => tracked.state = InstallState::UserActionRequested,
                None => {
                    tracing::debug!("Ignoring notification for untracked session {}", session_id);
                    return;
                }
            }
            match confirmation {
                Some(intent) => {
                    tracing::info!("Install session {} needs user confirmation", session_id);
                    if let Err(err) = self.platform.launch(intent) {
                        tracing::error!("Failed to show install confirmation: {:#}", err);
                    }
                }
                None => tracing::warn!(
                    "Install session {} asked for confirmation without an intent",
                    session_id
                ),
            }
            return;
        }

        let Some(mut tracked) = self.registry().remove(&session_id) else {
            tracing::debug!("Ignoring notification for untracked session {}", session_id);
            return;
        };
        if status == InstallStatus::Success {
            tracked.state = InstallState::Succeeded;
            tracing::info!("Install session {} succeeded", session_id);
            tracked.resolve(session_id, InstallOutcome::Succeeded);
            return;
        }

        tracked.state = InstallState::Failed;
        tracing::warn!(
            "Install session {} failed: {:?} {}",
            session_id,
            status,
            message.as_deref().unwrap_or("")
        );
        let fallback_launched = match self.platform.view_package(&tracked.artifact) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!("Fallback install failed: {:#}", err);
                false
            }
        };
        tracked.resolve(
            session_id,
            InstallOutcome::Failed {
                status,
                message,
                fallback_launched,
            },
        );
    }

    /// Stops tracking `session` and abandons it. Returns whether it was tracked.
    pub fn cancel(&self, session: SessionId) -> bool {
        let Some(tracked) = self.registry().remove(&session) else {
            return false;
        };
        self.abandon(session);
        tracing::info!("Install session {} cancelled", session);
        tracked.resolve(session, InstallOutcome::Cancelled);
        true
    }

    /// Gives up on installs that have waited longer than `age`.
    pub fn expire_older_than(&self, age: Duration) -> Vec<SessionId> {
        let expired: Vec<(SessionId, Tracked)> = {
            let mut registry = self.registry();
            let stale: Vec<SessionId> = registry
                .iter()
                .filter(|(_, t)| t.started.elapsed() >= age)
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| registry.remove(&id).map(|t| (id, t)))
                .collect()
        };
        expired
            .into_iter()
            .map(|(id, tracked)| {
                tracing::warn!("Install session {} expired without a platform result", id);
                tracked.resolve(id, InstallOutcome::Expired);
                id
            })
            .collect()
    }
}

impl<P> Installer<P>
where
    P: InstallPlatform + Send + Sync + 'static,
    P::Intent: Send + 'static,
{
    /// Drains `events` on a dedicated thread until every sender is gone.
    pub fn run_events(self: Arc<Self>, events: Receiver<InstallNotification<P::Intent>>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for notification in events {
                self.on_notification(notification);
            }
            tracing::debug!("install event channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::platform::MockInstallPlatform;
    use super::*;
    use mockall::predicate::eq;
    use std::io::Write;

    fn artifact() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"PK\x05\x06 not really an apk").unwrap();
        file
    }

    fn ready_platform(session: SessionId) -> MockInstallPlatform {
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(true));
        platform
            .expect_create_session()
            .times(1)
            .returning(move || Ok(session));
        platform
            .expect_write_session()
            .withf(|_, name, _, len| name == "app" && *len > 0)
            .returning(|_, _, _, _| Ok(()));
        platform.expect_commit_session().returning(|_| Ok(()));
        platform
    }

    fn notification(session: SessionId, status: InstallStatus) -> InstallNotification<String> {
        InstallNotification {
            session_id: session,
            status,
            message: None,
            confirmation: None,
        }
    }

    fn started(start: InstallStart) -> InstallHandle {
        match start {
            InstallStart::Started(handle) => handle,
            other => panic!("expected a started install, got {:?}", other),
        }
    }

    #[test]
    fn should_redirect_to_settings_without_permission() {
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(false));
        platform
            .expect_open_unknown_sources_settings()
            .times(1)
            .returning(|| Ok(()));
        platform.expect_create_session().never();
        let installer = Installer::new(platform, InstallerOptions::default());
        let file = artifact();
        assert!(matches!(
            installer.install(file.path()).unwrap(),
            InstallStart::NeedsPermission
        ));
        assert!(installer.tracked_sessions().is_empty());
    }

    #[test]
    fn should_launch_confirmation_then_succeed() {
        let mut platform = ready_platform(7);
        platform
            .expect_launch()
            .with(eq("confirm".to_string()))
            .times(1)
            .returning(|_| Ok(()));
        platform.expect_view_package().never();
        let installer = Installer::new(platform, InstallerOptions::default());
        let file = artifact();
        let handle = started(installer.install(file.path()).unwrap());
        assert_eq!(installer.state(7), Some(InstallState::AwaitingPlatformCallback));

        installer.on_notification(InstallNotification {
            confirmation: Some("confirm".to_string()),
            ..notification(7, InstallStatus::PendingUserAction)
        });
        assert_eq!(installer.state(7), Some(InstallState::UserActionRequested));
        assert!(handle.try_outcome().is_none());

        installer.on_notification(notification(7, InstallStatus::Success));
        assert_eq!(handle.wait().unwrap(), InstallOutcome::Succeeded);
        assert_eq!(installer.state(7), None);
    }

    type Shared<T> = Arc<Mutex<Option<T>>>;

    #[test]
    fn should_hold_session_open_until_commit_returns() {
        let installer_slot: Shared<Arc<Installer<MockInstallPlatform>>> = Arc::default();
        let seen: Shared<InstallState> = Arc::default();
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(true));
        platform.expect_create_session().returning(|| Ok(8));
        platform.expect_write_session().returning(|_, _, _, _| Ok(()));
        let (slot, state) = (Arc::clone(&installer_slot), Arc::clone(&seen));
        platform
            .expect_commit_session()
            .times(1)
            .returning(move |session| {
                let installer = slot.lock().unwrap().clone();
                *state.lock().unwrap() = installer.and_then(|i| i.state(session));
                Ok(())
            });
        let installer = Arc::new(Installer::new(platform, InstallerOptions::default()));
        *installer_slot.lock().unwrap() = Some(Arc::clone(&installer));

        let file = artifact();
        let _handle = started(installer.install(file.path()).unwrap());
        assert_eq!(*seen.lock().unwrap(), Some(InstallState::SessionOpen));
        assert_eq!(installer.state(8), Some(InstallState::AwaitingPlatformCallback));
        // break the platform -> installer cycle
        installer_slot.lock().unwrap().take();
    }

    #[test]
    fn should_keep_a_confirmation_that_arrives_during_commit() {
        let installer_slot: Shared<Arc<Installer<MockInstallPlatform>>> = Arc::default();
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(true));
        platform.expect_create_session().returning(|| Ok(6));
        platform.expect_write_session().returning(|_, _, _, _| Ok(()));
        platform.expect_launch().times(1).returning(|_| Ok(()));
        let slot = Arc::clone(&installer_slot);
        platform.expect_commit_session().returning(move |session| {
            let installer = slot.lock().unwrap().clone();
            if let Some(installer) = installer {
                installer.on_notification(InstallNotification {
                    confirmation: Some("confirm".to_string()),
                    ..notification(session, InstallStatus::PendingUserAction)
                });
            }
            Ok(())
        });
        let installer = Arc::new(Installer::new(platform, InstallerOptions::default()));
        *installer_slot.lock().unwrap() = Some(Arc::clone(&installer));

        let file = artifact();
        let _handle = started(installer.install(file.path()).unwrap());
        assert_eq!(installer.state(6), Some(InstallState::UserActionRequested));
        installer_slot.lock().unwrap().take();
    }

    #[test]
    fn should_fall_back_to_viewer_on_failure() {
        let mut platform = ready_platform(3);
        platform
            .expect_view_package()
            .times(1)
            .returning(|_| Ok(()));
        let installer = Installer::new(platform, InstallerOptions::default());
        let file = artifact();
        let handle = started(installer.install(file.path()).unwrap());
        installer.on_notification(InstallNotification {
            message: Some("INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string()),
            ..notification(3, InstallStatus::Conflict)
        });
        assert_eq!(
            handle.wait().unwrap(),
            InstallOutcome::Failed {
                status: InstallStatus::Conflict,
                message: Some("INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string()),
                fallback_launched: true,
            }
        );
        // a late duplicate is ignored
        installer.on_notification(notification(3, InstallStatus::Failure));
    }

    #[test]
    fn should_supersede_previous_install_by_default() {
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(true));
        let mut next = 0;
        platform.expect_create_session().times(2).returning(move || {
            next += 1;
            Ok(next)
        });
        platform.expect_write_session().returning(|_, _, _, _| Ok(()));
        platform.expect_commit_session().returning(|_| Ok(()));
        let installer = Installer::new(platform, InstallerOptions::default());
        let file = artifact();
        let first = started(installer.install(file.path()).unwrap());
        let second = started(installer.install(file.path()).unwrap());
        assert_eq!(first.wait().unwrap(), InstallOutcome::Superseded);
        assert_eq!(installer.tracked_sessions(), vec![second.session_id()]);
    }

    #[test]
    fn should_track_every_session_when_asked() {
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(true));
        let mut next = 10;
        platform.expect_create_session().returning(move || {
            next += 1;
            Ok(next)
        });
        platform.expect_write_session().returning(|_, _, _, _| Ok(()));
        platform.expect_commit_session().returning(|_| Ok(()));
        let options = InstallerOptions {
            tracking: TrackingPolicy::PerSession,
            ..Default::default()
        };
        let installer = Installer::new(platform, options);
        let file = artifact();
        let _first = started(installer.install(file.path()).unwrap());
        let _second = started(installer.install(file.path()).unwrap());
        assert_eq!(installer.tracked_sessions(), vec![11, 12]);
    }

    #[test]
    fn should_abandon_session_when_streaming_fails() {
        let mut platform = MockInstallPlatform::new();
        platform.expect_can_request_installs().returning(|| Ok(true));
        platform.expect_create_session().returning(|| Ok(5));
        platform
            .expect_write_session()
            .returning(|_, _, _, _| Err(anyhow::anyhow!("disk full")));
        platform
            .expect_abandon_session()
            .with(eq(5))
            .times(1)
            .returning(|_| Ok(()));
        platform.expect_commit_session().never();
        let installer = Installer::new(platform, InstallerOptions::default());
        let file = artifact();
        let err = installer.install(file.path()).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(installer.tracked_sessions().is_empty());
    }

    #[test]
    fn should_time_out_and_expire_silent_installs() {
        let mut platform = ready_platform(9);
        platform.expect_abandon_session().never();
        let options = InstallerOptions {
            timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let installer = Installer::new(platform, options);
        let file = artifact();
        let handle = started(installer.install(file.path()).unwrap());
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(20)),
            Err(InstallError::TimedOut(_))
        ));
        assert_eq!(installer.expire_older_than(Duration::ZERO), vec![9]);
        assert_eq!(handle.wait().unwrap(), InstallOutcome::Expired);
    }

    #[test]
    fn should_cancel_tracked_install() {
        let mut platform = ready_platform(4);
        platform
            .expect_abandon_session()
            .with(eq(4))
            .times(1)
            .returning(|_| Ok(()));
        let installer = Installer::new(platform, InstallerOptions::default());
        let file = artifact();
        let handle = started(installer.install(file.path()).unwrap());
        assert!(installer.cancel(4));
        assert!(!installer.cancel(4));
        assert_eq!(handle.wait().unwrap(), InstallOutcome::Cancelled);
    }

    #[test]
    fn should_fail_on_missing_artifact() {
        let platform = MockInstallPlatform::new();
        let installer = Installer::new(platform, InstallerOptions::default());
        assert!(matches!(
            installer.install(Path::new("/nonexistent/app.apk")),
            Err(InstallError::Io(_))
        ));
    }
}
