//! Build orchestration: patch, repackage, sign, then verify.
//!
//! Working copies are scoped temporary files in the configured work
//! directory and disappear on every exit path. Verification runs after the
//! artifact is in place and never fails a build.

use crate::apk::patch::{self, PatchPolicy, PatchSpec};
use crate::apk::repackage::{self, RepackageOptions};
use crate::apk::ApkMeta;
use crate::core::abi;
use crate::core::config::Settings;
use crate::core::error::BuildError;
use crate::install::{InstallPlatform, Installer, InstallerOptions};
use crate::sign::{self, IdentityConfig, IdentityStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tempfile::NamedTempFile;

pub const DEFAULT_APP_NAME: &str = "My App";
pub const DEFAULT_PACKAGE_NAME: &str = "com.example.myapp";
pub const DEFAULT_VERSION_CODE: &str = "1";
pub const DEFAULT_VERSION_NAME: &str = "1.0";

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn default_package_name() -> String {
    DEFAULT_PACKAGE_NAME.to_string()
}

fn default_version_code() -> String {
    DEFAULT_VERSION_CODE.to_string()
}

fn default_version_name() -> String {
    DEFAULT_VERSION_NAME.to_string()
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub template: PathBuf,
    /// Text written to the configuration asset, as is.
    pub config_content: String,
    pub output: PathBuf,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_package_name")]
    pub package_name: String,
    /// Parsed leniently, see [`parse_version_code`].
    #[serde(default = "default_version_code")]
    pub version_code: String,
    #[serde(default = "default_version_name")]
    pub version_name: String,
}

impl BuildRequest {
    pub fn new(template: impl Into<PathBuf>, config_content: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            config_content: config_content.into(),
            output: output.into(),
            app_name: default_app_name(),
            package_name: default_package_name(),
            version_code: default_version_code(),
            version_name: default_version_name(),
        }
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        let invalid = |msg: String| -> Result<(), BuildError> { Err(BuildError::InvalidRequest(msg)) };
        if self.template.as_os_str().is_empty() {
            return invalid("template path is empty".into());
        }
        if self.output.as_os_str().is_empty() {
            return invalid("output path is empty".into());
        }
        if !self.template.is_file() {
            return invalid(format!("template {} does not exist", self.template.display()));
        }
        if self.template == self.output {
            return invalid("output would overwrite the template".into());
        }
        if let Err(reason) = validate_package_name(&self.package_name) {
            return invalid(format!("package name `{}` {}", self.package_name, reason));
        }
        Ok(())
    }

    fn patch_spec(&self, provider_marker: &str) -> PatchSpec {
        PatchSpec {
            package_name: self.package_name.clone(),
            version_code: parse_version_code(&self.version_code),
            version_name: self.version_name.clone(),
            display_name: self.app_name.clone(),
            provider_marker: provider_marker.to_string(),
        }
    }
}

/// Signed 32-bit version code, or `1` when `input` does not parse as one.
pub fn parse_version_code(input: &str) -> i32 {
    match input.parse() {
        Ok(code) => code,
        Err(_) => {
            tracing::warn!("Version code `{}` is not a number, using 1", input);
            1
        }
    }
}

/// Java package name rules: two or more dot separated segments, each
/// starting with a letter and made of letters, digits and underscores.
pub fn validate_package_name(name: &str) -> Result<(), &'static str> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() < 2 {
        return Err("needs at least two segments");
    }
    for segment in segments {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            Some(_) => return Err("has a segment not starting with a letter"),
            None => return Err("has an empty segment"),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err("contains characters outside [A-Za-z0-9_.]");
        }
    }
    Ok(())
}

pub struct Pipeline {
    settings: Settings,
    identity: IdentityStore,
    work_dir: PathBuf,
}

impl Pipeline {
    /// `data_dir` anchors relative keystore paths.
    pub fn new(settings: Settings, data_dir: &Path) -> Result<Self, BuildError> {
        let identity = settings
            .identity
            .to_identity_config(data_dir)
            .map_err(BuildError::identity)?;
        Ok(Self::with_identity(settings, identity))
    }

    pub fn with_identity(settings: Settings, identity: IdentityConfig) -> Self {
        let work_dir = settings
            .archive
            .work_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self {
            settings,
            identity: IdentityStore::new(identity),
            work_dir,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn installer<P: InstallPlatform>(&self, platform: P) -> Installer<P> {
        Installer::new(platform, InstallerOptions::from(&self.settings.install))
    }

    fn working_copy(&self, prefix: &str) -> Result<NamedTempFile, BuildError> {
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".apk")
            .tempfile_in(&self.work_dir)?)
    }

    /// Runs the whole build on the calling thread.
    pub fn build_and_sign(&self, request: &BuildRequest) -> Result<PathBuf, BuildError> {
        request.validate()?;
        let span = tracing::info_span!("build", package = %request.package_name);
        let _enter = span.enter();
        tracing::info!(
            "Building {} from {}",
            request.output.display(),
            request.template.display()
        );

        let patched = self.working_copy("patched-")?;
        std::fs::copy(&request.template, patched.path())?;
        self.patch(patched.path(), request)?;

        let unsigned = self.working_copy("unsigned-")?;
        let options = RepackageOptions {
            config_asset: self.settings.archive.config_asset.clone(),
            signature_dir: self.settings.archive.signature_dir.clone(),
            align_stored: self.settings.archive.align_stored,
        };
        repackage::repackage(
            patched.path(),
            unsigned.path(),
            &request.config_content,
            &options,
        )
        .map_err(BuildError::repackage)?;
        drop(patched);

        let signer = self.identity.acquire().map_err(BuildError::identity)?;
        let out_dir = match request.output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&out_dir)?;
        let signed = tempfile::Builder::new()
            .prefix(".signing-")
            .suffix(".apk")
            .tempfile_in(&out_dir)?;
        sign::sign_apk(
            unsigned.path(),
            signed.path(),
            &signer,
            &self.settings.signing.to_options(),
        )
        .map_err(BuildError::signing)?;
        drop(unsigned);
        signed
            .persist(&request.output)
            .map_err(|err| BuildError::Io(err.error))?;
        tracing::info!("Signed artifact ready: {}", request.output.display());

        self.diagnose(&request.output);
        Ok(request.output.clone())
    }

    fn patch(&self, path: &Path, request: &BuildRequest) -> Result<(), BuildError> {
        let spec = request.patch_spec(&self.settings.archive.provider_marker);
        let strict = self.settings.patch.policy == PatchPolicy::Strict;
        match patch::patch_archive(path, &spec) {
            Ok(report) if strict && !report.is_clean() => {
                let failures: Vec<String> = report
                    .failures()
                    .map(|o| match &o.status {
                        patch::PatchStatus::Failed(reason) => format!("{}: {}", o.target, reason),
                        _ => o.target.clone(),
                    })
                    .collect();
                Err(BuildError::Patch(failures.join("; ")))
            }
            Ok(_) => Ok(()),
            Err(err) if strict => Err(BuildError::patch(err)),
            Err(err) => {
                tracing::error!("Patching failed, continuing with the unpatched template: {:#}", err);
                Ok(())
            }
        }
    }

    /// Logs verification and metadata of a finished artifact.
    fn diagnose(&self, artifact: &Path) {
        match sign::verify(artifact) {
            Ok(report) => report.log(),
            Err(err) => tracing::warn!("Verification could not run: {:#}", err),
        }
        match ApkMeta::read(artifact) {
            Ok(meta) => meta.log(&abi::supported_abis()),
            Err(err) => tracing::warn!("Could not read artifact metadata: {:#}", err),
        }
    }
}

impl Pipeline {
    /// Runs the build on a dedicated worker thread and hands its single
    /// result to `on_done` on that thread.
    pub fn spawn_build_with<F>(self: &Arc<Self>, request: BuildRequest, on_done: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce(Result<PathBuf, BuildError>) + Send + 'static,
    {
        let pipeline = Arc::clone(self);
        std::thread::Builder::new()
            .name("apkforge-build".to_string())
            .spawn(move || on_done(pipeline.build_and_sign(&request)))
    }

    pub fn spawn_build(self: &Arc<Self>, request: BuildRequest) -> BuildTask {
        let (sender, receiver) = mpsc::channel();
        let worker_sender = sender.clone();
        let worker = self.spawn_build_with(request, move |result| {
            let _ = worker_sender.send(result);
        });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                let _ = sender.send(Err(BuildError::Io(err)));
                None
            }
        };
        BuildTask {
            receiver: Some(receiver),
            worker,
        }
    }
}

/// A build running on its own thread.
#[derive(Debug)]
pub struct BuildTask {
    /// Dropped once the result has been handed out.
    receiver: Option<Receiver<Result<PathBuf, BuildError>>>,
    worker: Option<JoinHandle<()>>,
}

impl BuildTask {
    /// Blocks until the build finishes. Fails with [`BuildError::WorkerLost`]
    /// if the result was already taken by [`BuildTask::try_result`].
    pub fn wait(mut self) -> Result<PathBuf, BuildError> {
        let result = match self.receiver.take() {
            Some(receiver) => receiver.recv().unwrap_or(Err(BuildError::WorkerLost)),
            None => Err(BuildError::WorkerLost),
        };
        self.join();
        result
    }

    /// The result if the build has finished. Yields it only once, later
    /// calls return `None`.
    pub fn try_result(&mut self) -> Option<Result<PathBuf, BuildError>> {
        let receiver = self.receiver.as_ref()?;
        let result = match receiver.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => match &self.worker {
                // the worker may have sent between the poll and this check
                Some(worker) if worker.is_finished() => {
                    receiver.try_recv().unwrap_or(Err(BuildError::WorkerLost))
                }
                _ => return None,
            },
            Err(TryRecvError::Disconnected) => Err(BuildError::WorkerLost),
        };
        self.receiver = None;
        self.join();
        Some(result)
    }

    /// Whether the result has been handed out.
    pub fn is_delivered(&self) -> bool {
        self.receiver.is_none()
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("build worker panicked");
            }
        }
    }
}

/// Running builds addressed by integer handles, for callers that cannot
/// hold a [`BuildTask`] themselves.
#[derive(Debug, Default)]
pub struct BuildRegistry {
    last: AtomicI64,
    tasks: Mutex<HashMap<i64, BuildTask>>,
}

impl BuildRegistry {
    fn tasks(&self) -> MutexGuard<'_, HashMap<i64, BuildTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `task`. Handles start at 1.
    pub fn insert(&self, task: BuildTask) -> i64 {
        let handle = self.last.fetch_add(1, Ordering::Relaxed) + 1;
        self.tasks().insert(handle, task);
        handle
    }

    /// `None` while the build runs. The result is handed out once and the
    /// handle is forgotten with it.
    pub fn poll(&self, handle: i64) -> Option<Result<PathBuf, BuildError>> {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(&handle) else {
            return Some(Err(BuildError::UnknownBuild(handle)));
        };
        let result = task.try_result()?;
        tasks.remove(&handle);
        Some(result)
    }

    pub fn running(&self) -> usize {
        self.tasks().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_fall_back_to_version_code_one() {
        assert_eq!(parse_version_code("7"), 7);
        assert_eq!(parse_version_code("abc"), 1);
        assert_eq!(parse_version_code(""), 1);
        assert_eq!(parse_version_code(" 7"), 1);
    }

    #[test]
    fn should_parse_version_codes_as_signed_32_bit() {
        assert_eq!(parse_version_code("-5"), -5);
        assert_eq!(parse_version_code("2147483647"), i32::MAX);
        assert_eq!(parse_version_code("2147483648"), 1);
        assert_eq!(parse_version_code("3000000000"), 1);
    }

    #[test]
    fn should_validate_package_names() {
        assert!(validate_package_name("com.new.app").is_ok());
        assert!(validate_package_name("a.b_1").is_ok());
        assert!(validate_package_name("app").is_err());
        assert!(validate_package_name("com..app").is_err());
        assert!(validate_package_name("com.1app").is_err());
        assert!(validate_package_name("com.my-app").is_err());
    }

    #[test]
    fn should_reject_invalid_requests_before_touching_files() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.apk");
        std::fs::write(&template, b"PK").unwrap();
        let mut request = BuildRequest::new(&template, "{}", dir.path().join("out.apk"));
        assert!(request.validate().is_ok());
        request.package_name = "nodots".into();
        assert!(matches!(request.validate(), Err(BuildError::InvalidRequest(_))));
        let missing = BuildRequest::new(dir.path().join("missing.apk"), "{}", dir.path().join("out.apk"));
        assert!(matches!(missing.validate(), Err(BuildError::InvalidRequest(_))));
    }

    fn finished_task(result: Result<PathBuf, BuildError>) -> BuildTask {
        let (sender, receiver) = mpsc::channel();
        sender.send(result).unwrap();
        BuildTask {
            receiver: Some(receiver),
            worker: None,
        }
    }

    #[test]
    fn should_deliver_a_task_result_once() {
        let mut task = finished_task(Ok(PathBuf::from("out.apk")));
        assert!(!task.is_delivered());
        assert_eq!(task.try_result().unwrap().unwrap(), PathBuf::from("out.apk"));
        assert!(task.is_delivered());
        assert!(task.try_result().is_none());
        assert!(task.try_result().is_none());
        assert!(matches!(task.wait(), Err(BuildError::WorkerLost)));
    }

    #[test]
    fn should_report_a_silent_worker_as_lost() {
        let (sender, receiver) = mpsc::channel::<Result<PathBuf, BuildError>>();
        drop(sender);
        let mut task = BuildTask {
            receiver: Some(receiver),
            worker: None,
        };
        assert!(matches!(task.try_result(), Some(Err(BuildError::WorkerLost))));
        assert!(task.try_result().is_none());
    }

    #[test]
    fn should_forget_handles_once_polled() {
        let registry = BuildRegistry::default();
        let first = registry.insert(finished_task(Ok(PathBuf::from("a.apk"))));
        let second = registry.insert(finished_task(Err(BuildError::Signing("no key".into()))));
        assert_eq!((first, second), (1, 2));
        assert_eq!(registry.running(), 2);

        assert_eq!(registry.poll(first).unwrap().unwrap(), PathBuf::from("a.apk"));
        assert!(matches!(registry.poll(first), Some(Err(BuildError::UnknownBuild(1)))));
        assert!(matches!(registry.poll(second), Some(Err(BuildError::Signing(_)))));
        assert_eq!(registry.running(), 0);
    }

    #[test]
    fn should_apply_request_defaults_when_deserialized() {
        let request: BuildRequest =
            serde_json::from_str(r#"{"template":"t.apk","config_content":"{}","output":"o.apk"}"#).unwrap();
        assert_eq!(request.app_name, DEFAULT_APP_NAME);
        assert_eq!(request.package_name, DEFAULT_PACKAGE_NAME);
        assert_eq!(request.version_code, "1");
        assert_eq!(request.version_name, "1.0");
    }
}
