//! PackageInstaller sessions driven through JNI.

use super::ndk::{run_in_jvm, sdk_int};
use crate::install::{InstallNotification, InstallPlatform, InstallStatus, SessionId};
use anyhow::{Context, Result};
use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::JNIEnv;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::OnceLock;

/// Action of the broadcast the platform sends back for every committed session.
pub const RESULT_ACTION: &str = "uz.flutware.builder.INSTALL_RESULT";

const EXTRA_SESSION_ID: &str = "android.content.pm.extra.SESSION_ID";
const EXTRA_STATUS: &str = "android.content.pm.extra.STATUS";
const EXTRA_STATUS_MESSAGE: &str = "android.content.pm.extra.STATUS_MESSAGE";
const EXTRA_INTENT: &str = "android.intent.extra.INTENT";

const ACTION_VIEW: &str = "android.intent.action.VIEW";
const ACTION_MANAGE_UNKNOWN_APP_SOURCES: &str = "android.settings.MANAGE_UNKNOWN_APP_SOURCES";
const APK_MIME: &str = "application/vnd.android.package-archive";
const FILE_PROVIDER_CLASS: &str = "androidx.core.content.FileProvider";

const FLAG_ACTIVITY_NEW_TASK: i32 = 0x1000_0000;
const FLAG_GRANT_READ_URI_PERMISSION: i32 = 0x0000_0001;
const FLAG_UPDATE_CURRENT: i32 = 0x0800_0000;
const FLAG_MUTABLE: i32 = 0x0200_0000;
const MODE_FULL_INSTALL: i32 = 1;

const WRITE_CHUNK: usize = 64 * 1024;

pub type AndroidNotification = InstallNotification<GlobalRef>;

static EVENTS: OnceLock<Sender<AndroidNotification>> = OnceLock::new();

/// Creates the install result channel. Only the first call gets the receiver.
pub fn take_events() -> Option<Receiver<AndroidNotification>> {
    let (sender, receiver) = mpsc::channel();
    EVENTS.set(sender).ok().map(|_| receiver)
}

fn int_extra(env: &mut JNIEnv, intent: &JObject, name: &str, default: i32) -> Result<i32> {
    let key = env.new_string(name)?;
    Ok(env
        .call_method(
            intent,
            "getIntExtra",
            "(Ljava/lang/String;I)I",
            &[JValue::Object(&key), JValue::Int(default)],
        )?
        .i()?)
}

fn string_extra(env: &mut JNIEnv, intent: &JObject, name: &str) -> Result<Option<String>> {
    let key = env.new_string(name)?;
    let value = env
        .call_method(
            intent,
            "getStringExtra",
            "(Ljava/lang/String;)Ljava/lang/String;",
            &[JValue::Object(&key)],
        )?
        .l()?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(env.get_string(&JString::from(value))?.into()))
}

fn parcelable_extra(env: &mut JNIEnv, intent: &JObject, name: &str) -> Result<Option<GlobalRef>> {
    let key = env.new_string(name)?;
    let value = env
        .call_method(
            intent,
            "getParcelableExtra",
            "(Ljava/lang/String;)Landroid/os/Parcelable;",
            &[JValue::Object(&key)],
        )?
        .l()?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(env.new_global_ref(value)?))
}

/// Reads the session id, status, message and confirmation intent out of a result broadcast.
pub fn notification_from_intent(env: &mut JNIEnv, intent: &JObject) -> Result<AndroidNotification> {
    let session_id = int_extra(env, intent, EXTRA_SESSION_ID, -1)?;
    let status = InstallStatus::from_code(int_extra(env, intent, EXTRA_STATUS, InstallStatus::Failure.code())?);
    let message = string_extra(env, intent, EXTRA_STATUS_MESSAGE)?;
    let confirmation = match status {
        InstallStatus::PendingUserAction => parcelable_extra(env, intent, EXTRA_INTENT)?,
        _ => None,
    };
    Ok(InstallNotification {
        session_id,
        status,
        message,
        confirmation,
    })
}

/// Receives the result broadcast forwarded by the host's receiver.
#[no_mangle]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativeOnInstallResult(
    mut env: JNIEnv,
    _class: JClass,
    intent: JObject,
) {
    let notification = match notification_from_intent(&mut env, &intent) {
        Ok(notification) => notification,
        Err(err) => {
            tracing::error!("Unreadable install result: {:#}", err);
            return;
        }
    };
    tracing::debug!(
        "install result session={} status={:?}",
        notification.session_id,
        notification.status
    );
    match EVENTS.get() {
        Some(sender) => {
            if sender.send(notification).is_err() {
                tracing::warn!("Install event loop is gone, dropping result");
            }
        }
        None => tracing::warn!("No install event loop running, dropping result"),
    }
}

fn package_name<'local>(env: &mut JNIEnv<'local>, context: &JObject) -> Result<JObject<'local>> {
    Ok(env
        .call_method(context, "getPackageName", "()Ljava/lang/String;", &[])?
        .l()?)
}

fn package_installer<'local>(env: &mut JNIEnv<'local>, context: &JObject) -> Result<JObject<'local>> {
    let pm = env
        .call_method(
            context,
            "getPackageManager",
            "()Landroid/content/pm/PackageManager;",
            &[],
        )?
        .l()?;
    Ok(env
        .call_method(
            &pm,
            "getPackageInstaller",
            "()Landroid/content/pm/PackageInstaller;",
            &[],
        )?
        .l()?)
}

fn open_session<'local>(env: &mut JNIEnv<'local>, context: &JObject, session: SessionId) -> Result<JObject<'local>> {
    let installer = package_installer(env, context)?;
    Ok(env
        .call_method(
            &installer,
            "openSession",
            "(I)Landroid/content/pm/PackageInstaller$Session;",
            &[JValue::Int(session)],
        )?
        .l()?)
}

fn start_activity(env: &mut JNIEnv, context: &JObject, intent: &JObject) -> Result<()> {
    env.call_method(
        intent,
        "addFlags",
        "(I)Landroid/content/Intent;",
        &[JValue::Int(FLAG_ACTIVITY_NEW_TASK)],
    )?;
    env.call_method(
        context,
        "startActivity",
        "(Landroid/content/Intent;)V",
        &[JValue::Object(intent)],
    )?;
    Ok(())
}

/// [`InstallPlatform`] backed by `android.content.pm.PackageInstaller`.
#[derive(Clone, Debug)]
pub struct AndroidInstallPlatform {
    /// Suffix of the host's FileProvider authority, `<package>.<suffix>`.
    pub provider_suffix: String,
}

impl Default for AndroidInstallPlatform {
    fn default() -> Self {
        Self {
            provider_suffix: "fileprovider".to_string(),
        }
    }
}

impl InstallPlatform for AndroidInstallPlatform {
    type Intent = GlobalRef;

    fn can_request_installs(&self) -> Result<bool> {
        run_in_jvm(|env, context| {
            // the permission only exists from Oreo on
            if sdk_int(env)? < 26 {
                return Ok(true);
            }
            let pm = env
                .call_method(
                    context,
                    "getPackageManager",
                    "()Landroid/content/pm/PackageManager;",
                    &[],
                )?
                .l()?;
            Ok(env.call_method(&pm, "canRequestPackageInstalls", "()Z", &[])?.z()?)
        })
    }

    fn open_unknown_sources_settings(&self) -> Result<()> {
        run_in_jvm(|env, context| {
            let package = package_name(env, context)?;
            let package: String = env.get_string(&JString::from(package))?.into();
            let uri_string = env.new_string(format!("package:{package}"))?;
            let uri = env
                .call_static_method(
                    "android/net/Uri",
                    "parse",
                    "(Ljava/lang/String;)Landroid/net/Uri;",
                    &[JValue::Object(&uri_string)],
                )?
                .l()?;
            let action = env.new_string(ACTION_MANAGE_UNKNOWN_APP_SOURCES)?;
            let intent = env.new_object(
                "android/content/Intent",
                "(Ljava/lang/String;Landroid/net/Uri;)V",
                &[JValue::Object(&action), JValue::Object(&uri)],
            )?;
            start_activity(env, context, &intent)
        })
        .context("Failed to open the unknown sources settings")
    }

    fn create_session(&self) -> Result<SessionId> {
        run_in_jvm(|env, context| {
            let params = env.new_object(
                "android/content/pm/PackageInstaller$SessionParams",
                "(I)V",
                &[JValue::Int(MODE_FULL_INSTALL)],
            )?;
            let installer = package_installer(env, context)?;
            Ok(env
                .call_method(
                    &installer,
                    "createSession",
                    "(Landroid/content/pm/PackageInstaller$SessionParams;)I",
                    &[JValue::Object(&params)],
                )?
                .i()?)
        })
        .context("Failed to create an install session")
    }

    fn write_session(&self, session: SessionId, name: &str, artifact: &Path, len: u64) -> Result<()> {
        let mut file = File::open(artifact).with_context(|| format!("While opening {}", artifact.display()))?;
        run_in_jvm(|env, context| {
            let session = open_session(env, context, session)?;
            let name = env.new_string(name)?;
            let out = env
                .call_method(
                    &session,
                    "openWrite",
                    "(Ljava/lang/String;JJ)Ljava/io/OutputStream;",
                    &[JValue::Object(&name), JValue::Long(0), JValue::Long(len as i64)],
                )?
                .l()?;
            let mut buf = vec![0u8; WRITE_CHUNK];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let chunk = env.byte_array_from_slice(&buf[..n])?;
                env.call_method(
                    &out,
                    "write",
                    "([BII)V",
                    &[JValue::Object(&chunk), JValue::Int(0), JValue::Int(n as i32)],
                )?;
                env.delete_local_ref(chunk)?;
            }
            env.call_method(&session, "fsync", "(Ljava/io/OutputStream;)V", &[JValue::Object(&out)])?;
            env.call_method(&out, "close", "()V", &[])?;
            env.call_method(&session, "close", "()V", &[])?;
            Ok(())
        })
        .with_context(|| format!("Failed to write {} into session", artifact.display()))
    }

    fn commit_session(&self, session: SessionId) -> Result<()> {
        run_in_jvm(|env, context| {
            let action = env.new_string(RESULT_ACTION)?;
            let intent = env.new_object(
                "android/content/Intent",
                "(Ljava/lang/String;)V",
                &[JValue::Object(&action)],
            )?;
            let package = package_name(env, context)?;
            env.call_method(
                &intent,
                "setPackage",
                "(Ljava/lang/String;)Landroid/content/Intent;",
                &[JValue::Object(&package)],
            )?;
            // the installer fills in the extras, so the intent must stay mutable on 12+
            let flags = if sdk_int(env)? >= 31 {
                FLAG_UPDATE_CURRENT | FLAG_MUTABLE
            } else {
                FLAG_UPDATE_CURRENT
            };
            let pending = env
                .call_static_method(
                    "android/app/PendingIntent",
                    "getBroadcast",
                    "(Landroid/content/Context;ILandroid/content/Intent;I)Landroid/app/PendingIntent;",
                    &[
                        JValue::Object(context),
                        JValue::Int(session),
                        JValue::Object(&intent),
                        JValue::Int(flags),
                    ],
                )?
                .l()?;
            let sender = env
                .call_method(&pending, "getIntentSender", "()Landroid/content/IntentSender;", &[])?
                .l()?;
            let session = open_session(env, context, session)?;
            env.call_method(
                &session,
                "commit",
                "(Landroid/content/IntentSender;)V",
                &[JValue::Object(&sender)],
            )?;
            env.call_method(&session, "close", "()V", &[])?;
            Ok(())
        })
        .with_context(|| format!("Failed to commit session {session}"))
    }

    fn abandon_session(&self, session: SessionId) -> Result<()> {
        run_in_jvm(|env, context| {
            let installer = package_installer(env, context)?;
            env.call_method(&installer, "abandonSession", "(I)V", &[JValue::Int(session)])?;
            Ok(())
        })
        .with_context(|| format!("Failed to abandon session {session}"))
    }

    fn launch(&self, intent: GlobalRef) -> Result<()> {
        run_in_jvm(|env, context| start_activity(env, context, intent.as_obj()))
            .context("Failed to launch the install confirmation")
    }

    fn view_package(&self, artifact: &Path) -> Result<()> {
        run_in_jvm(|env, context| {
            let package = package_name(env, context)?;
            let package: String = env.get_string(&JString::from(package))?.into();
            let authority = env.new_string(format!("{package}.{}", self.provider_suffix))?;

            // androidx classes are only reachable through the app's own loader
            let loader = env
                .call_method(context, "getClassLoader", "()Ljava/lang/ClassLoader;", &[])?
                .l()?;
            let class_name = env.new_string(FILE_PROVIDER_CLASS)?;
            let provider = env
                .call_method(
                    &loader,
                    "loadClass",
                    "(Ljava/lang/String;)Ljava/lang/Class;",
                    &[JValue::Object(&class_name)],
                )?
                .l()?;
            let provider = JClass::from(provider);

            let path = env.new_string(artifact.to_string_lossy())?;
            let file = env.new_object("java/io/File", "(Ljava/lang/String;)V", &[JValue::Object(&path)])?;
            let uri = env
                .call_static_method(
                    &provider,
                    "getUriForFile",
                    "(Landroid/content/Context;Ljava/lang/String;Ljava/io/File;)Landroid/net/Uri;",
                    &[JValue::Object(context), JValue::Object(&authority), JValue::Object(&file)],
                )?
                .l()?;

            let action = env.new_string(ACTION_VIEW)?;
            let intent = env.new_object(
                "android/content/Intent",
                "(Ljava/lang/String;)V",
                &[JValue::Object(&action)],
            )?;
            let mime = env.new_string(APK_MIME)?;
            env.call_method(
                &intent,
                "setDataAndType",
                "(Landroid/net/Uri;Ljava/lang/String;)Landroid/content/Intent;",
                &[JValue::Object(&uri), JValue::Object(&mime)],
            )?;
            env.call_method(
                &intent,
                "addFlags",
                "(I)Landroid/content/Intent;",
                &[JValue::Int(FLAG_GRANT_READ_URI_PERMISSION)],
            )?;
            start_activity(env, context, &intent)
        })
        .with_context(|| format!("Failed to open {} in the package viewer", artifact.display()))
    }
}
