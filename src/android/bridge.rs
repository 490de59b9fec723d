//! Entry points the host app calls to build and install.

use super::installer::{take_events, AndroidInstallPlatform};
use crate::core::config::Settings;
use crate::install::{InstallStart, Installer};
use crate::pipeline::{BuildRegistry, BuildRequest, Pipeline};
use anyhow::{Context, Result};
use jni::objects::{JClass, JString};
use jni::sys::{jint, jlong, jstring};
use jni::JNIEnv;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

struct Runtime {
    pipeline: Arc<Pipeline>,
    installer: Arc<Installer<AndroidInstallPlatform>>,
    builds: BuildRegistry,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> Result<&'static Runtime> {
    RUNTIME.get().context("nativeConfigure has not been called")
}

fn read_string(env: &mut JNIEnv, s: &JString) -> Result<String> {
    Ok(env.get_string(s)?.into())
}

/// Returns `message` as a Java string, or null for `None`.
fn to_jstring(env: &mut JNIEnv, message: Option<String>) -> jstring {
    let Some(message) = message else {
        return std::ptr::null_mut();
    };
    match env.new_string(&message) {
        Ok(string) => string.into_raw(),
        Err(err) => {
            tracing::error!("Could not hand `{}` to Java: {}", message, err);
            std::ptr::null_mut()
        }
    }
}

/// Raises a `RuntimeException` carrying `message` in the calling thread.
fn throw(env: &mut JNIEnv, message: &str) {
    if let Err(err) = env.throw_new("java/lang/RuntimeException", message) {
        tracing::error!("Could not throw `{}`: {}", message, err);
    }
}

/// The output path for a finished build, or a pending exception and null.
fn deliver(env: &mut JNIEnv, result: Result<PathBuf>) -> jstring {
    match result {
        Ok(path) => {
            tracing::info!("Built {}", path.display());
            to_jstring(env, Some(path.to_string_lossy().into_owned()))
        }
        Err(err) => {
            tracing::error!("Build failed: {:#}", err);
            throw(env, &format!("{:#}", err));
            std::ptr::null_mut()
        }
    }
}

fn configure(data_dir: &Path, settings_path: &Path) -> Result<()> {
    let settings = Settings::load_or_default(settings_path);
    let pipeline = Arc::new(Pipeline::new(settings, data_dir)?);
    let installer = Arc::new(pipeline.installer(AndroidInstallPlatform::default()));
    if let Some(events) = take_events() {
        Arc::clone(&installer).run_events(events);
    }
    let runtime = Runtime {
        pipeline,
        installer,
        builds: BuildRegistry::default(),
    };
    if RUNTIME.set(runtime).is_err() {
        tracing::debug!("runtime already configured");
    }
    Ok(())
}

#[no_mangle]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativeConfigure(
    mut env: JNIEnv,
    _class: JClass,
    data_dir: JString,
    settings_path: JString,
) -> jstring {
    let result = (|| -> Result<()> {
        let data_dir = PathBuf::from(read_string(&mut env, &data_dir)?);
        let settings_path = PathBuf::from(read_string(&mut env, &settings_path)?);
        configure(&data_dir, &settings_path)
    })();
    let message = result.err().map(|err| format!("{:#}", err));
    to_jstring(&mut env, message)
}

#[allow(clippy::too_many_arguments)]
fn read_request(
    env: &mut JNIEnv,
    template: &JString,
    config_content: &JString,
    output: &JString,
    app_name: &JString,
    package_name: &JString,
    version_code: &JString,
    version_name: &JString,
) -> Result<BuildRequest> {
    let mut request = BuildRequest::new(
        read_string(env, template)?,
        read_string(env, config_content)?,
        read_string(env, output)?,
    );
    request.app_name = read_string(env, app_name)?;
    request.package_name = read_string(env, package_name)?;
    request.version_code = read_string(env, version_code)?;
    request.version_name = read_string(env, version_name)?;
    Ok(request)
}

/// Builds on a worker thread and returns the output path once it is done.
/// Failures are thrown as `RuntimeException`.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativeBuild(
    mut env: JNIEnv,
    _class: JClass,
    template: JString,
    config_content: JString,
    output: JString,
    app_name: JString,
    package_name: JString,
    version_code: JString,
    version_name: JString,
) -> jstring {
    let result = read_request(
        &mut env,
        &template,
        &config_content,
        &output,
        &app_name,
        &package_name,
        &version_code,
        &version_name,
    )
    .and_then(|request| {
        let task = runtime()?.pipeline.spawn_build(request);
        Ok(task.wait()?)
    });
    deliver(&mut env, result)
}

/// Starts a build and returns at once with a handle for `nativePollBuild`.
/// Returns 0 with a pending exception when the request cannot be read.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativeStartBuild(
    mut env: JNIEnv,
    _class: JClass,
    template: JString,
    config_content: JString,
    output: JString,
    app_name: JString,
    package_name: JString,
    version_code: JString,
    version_name: JString,
) -> jlong {
    let result = read_request(
        &mut env,
        &template,
        &config_content,
        &output,
        &app_name,
        &package_name,
        &version_code,
        &version_name,
    )
    .and_then(|request| {
        let runtime = runtime()?;
        let task = runtime.pipeline.spawn_build(request);
        Ok(runtime.builds.insert(task))
    });
    match result {
        Ok(handle) => handle,
        Err(err) => {
            throw(&mut env, &format!("{:#}", err));
            0
        }
    }
}

/// Null while the build runs, then the output path exactly once. A failed
/// build or a stale handle throws.
#[no_mangle]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativePollBuild(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = match runtime() {
        Ok(runtime) => match runtime.builds.poll(handle) {
            Some(result) => result.map_err(anyhow::Error::from),
            None => return std::ptr::null_mut(),
        },
        Err(err) => Err(err),
    };
    deliver(&mut env, result)
}

/// `0` once the session is committed, `1` when the user has to grant the
/// install permission first, `-1` on failure.
#[no_mangle]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativeInstall(
    mut env: JNIEnv,
    _class: JClass,
    artifact: JString,
) -> jint {
    let result = (|| -> Result<InstallStart> {
        let artifact = PathBuf::from(read_string(&mut env, &artifact)?);
        Ok(runtime()?.installer.install(&artifact)?)
    })();
    match result {
        Ok(InstallStart::Started(handle)) => {
            tracing::info!("Install session {} committed", handle.session_id());
            0
        }
        Ok(InstallStart::NeedsPermission) => 1,
        Err(err) => {
            tracing::error!("Install failed: {:#}", err);
            -1
        }
    }
}
