//! Logging setup. Everything in the crate logs through `tracing`; on Android
//! events are forwarded to logcat through the `log` facade.

#[cfg(not(target_os = "android"))]
pub fn init(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "apkforge=debug" } else { "apkforge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // a second init (tests, embedding hosts) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(target_os = "android")]
pub fn init(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(level)
            .with_tag("apkforge"),
    );
}
