use crate::apk::patch::PatchPolicy;
use crate::install::TrackingPolicy;
use crate::sign::identity::{DistinguishedName, IdentityConfig};
use crate::sign::SignOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path of the embedded configuration asset inside every template.
pub const CONFIG_ASSET: &str = "assets/flutter_assets/assets/project.json";

/// Directory holding v1 signature files. Always stripped before re-signing.
pub const SIGNATURE_DIR: &str = "META-INF/";

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Settings {
    #[serde(default)]
    pub identity: IdentitySettings,

    /// Every group carries `#[serde(default)]`: a missing or broken `[signing]`
    /// group must not throw away a perfectly valid `[identity]` group.
    #[serde(default)]
    pub signing: SigningSettings,

    #[serde(default)]
    pub archive: ArchiveSettings,

    #[serde(default)]
    pub patch: PatchSettings,

    #[serde(default)]
    pub install: InstallSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdentitySettings {
    /// Relative paths are resolved against the data directory handed to the pipeline.
    #[serde(default = "default_keystore")]
    pub keystore: PathBuf,
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// Name of an environment variable that overrides `passphrase` when set.
    #[serde(default)]
    pub passphrase_env: Option<String>,
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_keystore() -> PathBuf {
    PathBuf::from("flutware_local.p12")
}

fn default_alias() -> String {
    "flutware".to_string()
}

fn default_passphrase() -> String {
    "flutware_secure".to_string()
}

fn default_key_bits() -> usize {
    2048
}

fn default_validity_days() -> u32 {
    36500
}

fn default_subject() -> String {
    "CN=Flutware, O=Self, C=UZ".to_string()
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            keystore: default_keystore(),
            alias: default_alias(),
            passphrase: default_passphrase(),
            passphrase_env: None,
            key_bits: default_key_bits(),
            validity_days: default_validity_days(),
            subject: default_subject(),
        }
    }
}

impl IdentitySettings {
    pub fn resolve_passphrase(&self) -> String {
        self.passphrase_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_else(|| self.passphrase.clone())
    }

    pub fn to_identity_config(&self, data_dir: &Path) -> Result<IdentityConfig> {
        let keystore_path = if self.keystore.is_absolute() {
            self.keystore.clone()
        } else {
            data_dir.join(&self.keystore)
        };
        Ok(IdentityConfig {
            keystore_path,
            alias: self.alias.clone(),
            passphrase: self.resolve_passphrase(),
            key_bits: self.key_bits,
            validity_days: self.validity_days,
            subject: DistinguishedName::parse(&self.subject)
                .with_context(|| format!("Invalid identity subject `{}`", self.subject))?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SigningSettings {
    #[serde(default = "default_true")]
    pub v1: bool,
    #[serde(default = "default_true")]
    pub v2: bool,
    #[serde(default = "default_true")]
    pub v3: bool,
    #[serde(default = "default_min_sdk")]
    pub min_sdk: u32,
}

fn default_true() -> bool {
    true
}

fn default_min_sdk() -> u32 {
    21
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            v1: true,
            v2: true,
            v3: true,
            min_sdk: default_min_sdk(),
        }
    }
}

impl SigningSettings {
    pub fn to_options(&self) -> SignOptions {
        SignOptions {
            v1: self.v1,
            v2: self.v2,
            v3: self.v3,
            min_sdk: self.min_sdk,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiveSettings {
    #[serde(default = "default_config_asset")]
    pub config_asset: String,
    #[serde(default = "default_signature_dir")]
    pub signature_dir: String,
    /// Provider authorities containing `.<marker>` are moved to the new package.
    #[serde(default = "default_provider_marker")]
    pub provider_marker: String,
    /// Re-emit stored entries on 4 byte boundaries.
    #[serde(default = "default_true")]
    pub align_stored: bool,
    /// Where working copies are created. Defaults to the system temp dir.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_config_asset() -> String {
    CONFIG_ASSET.to_string()
}

fn default_signature_dir() -> String {
    SIGNATURE_DIR.to_string()
}

fn default_provider_marker() -> String {
    "fileprovider".to_string()
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            config_asset: default_config_asset(),
            signature_dir: default_signature_dir(),
            provider_marker: default_provider_marker(),
            align_stored: true,
            work_dir: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct PatchSettings {
    #[serde(default)]
    pub policy: PatchPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstallSettings {
    #[serde(default)]
    pub tracking: TrackingPolicy,
    /// Name the artifact is written under inside an install session.
    #[serde(default = "default_session_entry")]
    pub session_entry: String,
    /// How long a caller waits for the platform to report back. Unbounded if absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_session_entry() -> String {
    "app".to_string()
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            tracking: TrackingPolicy::default(),
            session_entry: default_session_entry(),
            timeout_secs: None,
        }
    }
}

impl InstallSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("While reading settings `{}`", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("While parsing settings `{}`", path.display()))
    }

    /// Like [`Settings::load`], but a missing or malformed file yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!("Using default settings: {:#}", err);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn with_settings_file(content: &str, f: impl Fn(&Path)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apkforge.toml");
        fs::write(&path, content).unwrap();
        f(&path)
    }

    #[test]
    fn should_default_every_group() {
        let settings = Settings::default();
        assert_eq!(settings.identity.alias, "flutware");
        assert_eq!(settings.identity.key_bits, 2048);
        assert_eq!(settings.signing.min_sdk, 21);
        assert!(settings.signing.v1 && settings.signing.v2 && settings.signing.v3);
        assert_eq!(settings.archive.config_asset, CONFIG_ASSET);
        assert_eq!(settings.patch.policy, PatchPolicy::BestEffort);
        assert_eq!(settings.install.tracking, TrackingPolicy::LatestOnly);
        assert_eq!(settings.install.timeout(), None);
    }

    #[test]
    fn should_keep_valid_groups_next_to_partial_ones() {
        with_settings_file(
            r#"
                [identity]
                alias = "release"
                key_bits = 1024

                [signing]
                v1 = false

                [patch]
                policy = "strict"

                [install]
                tracking = "per-session"
                timeout_secs = 30
            "#,
            |path| {
                let settings = Settings::load(path).unwrap();
                assert_eq!(settings.identity.alias, "release");
                assert_eq!(settings.identity.passphrase, "flutware_secure");
                assert!(!settings.signing.v1);
                assert!(settings.signing.v2);
                assert_eq!(settings.patch.policy, PatchPolicy::Strict);
                assert_eq!(settings.install.tracking, TrackingPolicy::PerSession);
                assert_eq!(settings.install.timeout(), Some(Duration::from_secs(30)));
                assert_eq!(settings.install.session_entry, "app");
            },
        );
    }

    #[test]
    fn should_fall_back_to_defaults_on_malformed_file() {
        with_settings_file("[identity\nalias = ", |path| {
            assert!(Settings::load(path).is_err());
            let settings = Settings::load_or_default(path);
            assert_eq!(settings.identity.alias, "flutware");
        });
    }

    #[test]
    fn should_resolve_relative_keystore_against_data_dir() {
        let settings = IdentitySettings::default();
        let config = settings.to_identity_config(Path::new("/data/app")).unwrap();
        assert_eq!(config.keystore_path, Path::new("/data/app/flutware_local.p12"));
        assert_eq!(config.subject.common_name(), Some("Flutware"));
    }

    #[test]
    fn should_prefer_passphrase_from_environment() {
        let settings = IdentitySettings {
            passphrase_env: Some("APKFORGE_TEST_PASSPHRASE_7F3A".to_string()),
            ..Default::default()
        };
        std::env::set_var("APKFORGE_TEST_PASSPHRASE_7F3A", "from-env");
        assert_eq!(settings.resolve_passphrase(), "from-env");
        std::env::remove_var("APKFORGE_TEST_PASSPHRASE_7F3A");
        assert_eq!(settings.resolve_passphrase(), "flutware_secure");
    }
}
