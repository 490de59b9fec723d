//! Errors surfaced at the crate boundary.
//!
//! Internals work with [`anyhow::Result`]; the orchestrator and the installer
//! fold those into one of the typed values below, keeping the full message
//! chain.

use std::time::Duration;
use thiserror::Error;

/// The single failure a build reports to its caller.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The request was rejected before any file was touched.
    #[error("Invalid build request: {0}")]
    InvalidRequest(String),

    /// Manifest or resource table editing failed under the strict policy.
    #[error("Patching failed: {0}")]
    Patch(String),

    /// Copying entries or injecting the configuration asset failed.
    #[error("Repackaging failed: {0}")]
    Repackage(String),

    /// The keystore could not be read, parsed or created.
    #[error("Signing identity unavailable: {0}")]
    Identity(String),

    /// Signing failed. The message is the signer's own.
    #[error("{0}")]
    Signing(String),

    /// Working copy management failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The build worker went away without reporting a result.
    #[error("Build worker terminated without a result")]
    WorkerLost,

    /// No running build has this handle, or its result was already taken.
    #[error("Unknown build handle {0}")]
    UnknownBuild(i64),
}

impl BuildError {
    pub(crate) fn patch(err: anyhow::Error) -> Self {
        Self::Patch(format!("{:#}", err))
    }

    pub(crate) fn repackage(err: anyhow::Error) -> Self {
        Self::Repackage(format!("{:#}", err))
    }

    pub(crate) fn identity(err: anyhow::Error) -> Self {
        Self::Identity(format!("{:#}", err))
    }

    pub(crate) fn signing(err: anyhow::Error) -> Self {
        Self::Signing(format!("{:#}", err))
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    /// The artifact could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The platform installer rejected a call.
    #[error("Platform installer error: {0}")]
    Platform(String),

    /// No terminal notification arrived in time.
    #[error("Install did not complete within {0:?}")]
    TimedOut(Duration),

    /// The install was cancelled or its tracking was dropped.
    #[error("Install was cancelled")]
    Cancelled,
}

impl InstallError {
    pub(crate) fn platform(err: anyhow::Error) -> Self {
        Self::Platform(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn should_keep_signing_message_verbatim() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("key too small"));
        let err = BuildError::signing(err.context("while signing").unwrap_err());
        assert_eq!(err.to_string(), "while signing: key too small");
    }
}
