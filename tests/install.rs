mod common;

use apkforge::core::config::Settings;
use apkforge::install::{
    InstallNotification, InstallOutcome, InstallPlatform, InstallStart, InstallStatus, SessionId,
};
use apkforge::pipeline::BuildRequest;
use apkforge::InstallError;
use common::Fixture;
use mockall::mock;
use mockall::predicate::eq;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

mock! {
    Platform {}
    impl InstallPlatform for Platform {
        type Intent = String;
        fn can_request_installs(&self) -> anyhow::Result<bool>;
        fn open_unknown_sources_settings(&self) -> anyhow::Result<()>;
        fn create_session(&self) -> anyhow::Result<SessionId>;
        fn write_session(&self, session: SessionId, name: &str, artifact: &Path, len: u64) -> anyhow::Result<()>;
        fn commit_session(&self, session: SessionId) -> anyhow::Result<()>;
        fn abandon_session(&self, session: SessionId) -> anyhow::Result<()>;
        fn launch(&self, intent: String) -> anyhow::Result<()>;
        fn view_package(&self, artifact: &Path) -> anyhow::Result<()>;
    }
}

fn built_artifact(fixture: &Fixture) -> PathBuf {
    let request = BuildRequest::new(&fixture.template, "{}", fixture.path("out.apk"));
    fixture.pipeline.build_and_sign(&request).unwrap()
}

fn committing_platform(session: SessionId, artifact: &Path) -> MockPlatform {
    let len = std::fs::metadata(artifact).unwrap().len();
    let expected = artifact.to_path_buf();
    let mut platform = MockPlatform::new();
    platform.expect_can_request_installs().returning(|| Ok(true));
    platform
        .expect_create_session()
        .times(1)
        .returning(move || Ok(session));
    platform
        .expect_write_session()
        .withf(move |s, name, path, l| *s == session && name == "app" && path == expected && *l == len)
        .times(1)
        .returning(|_, _, _, _| Ok(()));
    platform
        .expect_commit_session()
        .with(eq(session))
        .times(1)
        .returning(|_| Ok(()));
    platform
}

#[test]
fn should_install_a_built_artifact_through_the_event_loop() {
    let fixture = Fixture::new();
    let artifact = built_artifact(&fixture);
    let mut platform = committing_platform(11, &artifact);
    platform
        .expect_launch()
        .with(eq("confirm-11".to_string()))
        .times(1)
        .returning(|_| Ok(()));

    let installer = Arc::new(fixture.pipeline.installer(platform));
    let (events, receiver) = mpsc::channel();
    let worker = Arc::clone(&installer).run_events(receiver);

    let InstallStart::Started(handle) = installer.install(&artifact).unwrap() else {
        panic!("permission should be granted");
    };
    assert_eq!(handle.session_id(), 11);
    events
        .send(InstallNotification {
            session_id: 11,
            status: InstallStatus::PendingUserAction,
            message: None,
            confirmation: Some("confirm-11".to_string()),
        })
        .unwrap();
    events
        .send(InstallNotification {
            session_id: 11,
            status: InstallStatus::Success,
            message: None,
            confirmation: None,
        })
        .unwrap();

    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)).unwrap(),
        InstallOutcome::Succeeded
    );
    drop(events);
    worker.join().unwrap();
    assert!(installer.tracked_sessions().is_empty());
}

#[test]
fn should_hand_a_rejected_artifact_to_the_package_viewer() {
    let fixture = Fixture::new();
    let artifact = built_artifact(&fixture);
    let mut platform = committing_platform(4, &artifact);
    let expected = artifact.clone();
    platform
        .expect_view_package()
        .withf(move |path| path == expected)
        .times(1)
        .returning(|_| Ok(()));
    let installer = fixture.pipeline.installer(platform);

    let InstallStart::Started(handle) = installer.install(&artifact).unwrap() else {
        panic!("permission should be granted");
    };
    installer.on_notification(InstallNotification {
        session_id: 4,
        status: InstallStatus::from_code(5),
        message: Some("INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string()),
        confirmation: None,
    });
    assert_eq!(
        handle.wait().unwrap(),
        InstallOutcome::Failed {
            status: InstallStatus::Conflict,
            message: Some("INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string()),
            fallback_launched: true,
        }
    );
}

#[test]
fn should_bound_the_wait_with_the_configured_timeout() {
    let mut settings = Settings::default();
    settings.install.timeout_secs = Some(0);
    let fixture = Fixture::with_settings(settings);
    let artifact = built_artifact(&fixture);
    let installer = fixture.pipeline.installer(committing_platform(9, &artifact));

    let InstallStart::Started(handle) = installer.install(&artifact).unwrap() else {
        panic!("permission should be granted");
    };
    assert!(matches!(handle.wait(), Err(InstallError::TimedOut(_))));
    assert_eq!(installer.tracked_sessions(), vec![9]);
}

#[test]
fn should_not_open_a_session_without_permission() {
    let fixture = Fixture::new();
    let artifact = built_artifact(&fixture);
    let mut platform = MockPlatform::new();
    platform.expect_can_request_installs().returning(|| Ok(false));
    platform
        .expect_open_unknown_sources_settings()
        .times(1)
        .returning(|| Ok(()));
    platform.expect_create_session().never();
    let installer = fixture.pipeline.installer(platform);
    assert!(matches!(
        installer.install(&artifact).unwrap(),
        InstallStart::NeedsPermission
    ));
}
