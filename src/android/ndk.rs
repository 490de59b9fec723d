use anyhow::{Context, Result};
use jni::objects::{GlobalRef, JClass, JObject};
use jni::sys::{jint, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM};
use std::ffi::c_void;
use std::sync::OnceLock;

static JAVA_VM: OnceLock<JavaVM> = OnceLock::new();
static APP_CONTEXT: OnceLock<GlobalRef> = OnceLock::new();

#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: *mut jni::sys::JavaVM, _reserved: *mut c_void) -> jint {
    crate::core::logging::init(false);
    match unsafe { JavaVM::from_raw(vm) } {
        Ok(vm) => {
            let _ = JAVA_VM.set(vm);
        }
        Err(err) => tracing::error!("Failed to get JavaVM: {}", err),
    }
    JNI_VERSION_1_6
}

/// Called once by the host with its application context.
#[no_mangle]
pub extern "system" fn Java_uz_flutware_builder_app_ApkForgeBridge_nativeInit(
    env: JNIEnv,
    _class: JClass,
    context: JObject,
) {
    match env.new_global_ref(context) {
        Ok(context) => {
            if APP_CONTEXT.set(context).is_err() {
                tracing::debug!("application context already set");
            }
        }
        Err(err) => tracing::error!("Failed to keep application context: {}", err),
    }
}

pub fn java_vm() -> Result<&'static JavaVM> {
    JAVA_VM.get().context("JNI_OnLoad has not run")
}

pub fn app_context() -> Result<&'static GlobalRef> {
    APP_CONTEXT.get().context("nativeInit has not been called")
}

/// A higher-order function to run a provided JNI function within the JVM context.
///
/// Pending Java exceptions are described and cleared when the function fails.
pub fn run_in_jvm<F, T>(jni_function: F) -> Result<T>
where
    F: FnOnce(&mut JNIEnv, &JObject) -> Result<T>,
{
    let vm = java_vm()?;
    let context = app_context()?;
    let mut env = vm
        .attach_current_thread()
        .context("Failed to attach thread")?;

    let res = jni_function(&mut env, context.as_obj());
    if res.is_err() && env.exception_check().unwrap_or(false) {
        let _ = env.exception_describe();
        let _ = env.exception_clear();
    }
    res
}

pub fn sdk_int(env: &mut JNIEnv) -> Result<i32> {
    Ok(env
        .get_static_field("android/os/Build$VERSION", "SDK_INT", "I")?
        .i()?)
}
