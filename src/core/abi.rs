//! ABI introspection for hosts without a platform query.

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Target {
    ArmV7a = 1,
    Arm64V8a = 2,
    X86 = 3,
    X86_64 = 4,
}

impl Target {
    /// Identifier used in the NDK to refer to the ABI
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm64V8a => "arm64-v8a",
            Self::ArmV7a => "armeabi-v7a",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
        }
    }

    pub fn from_abi(abi: &str) -> Option<Self> {
        Some(match abi {
            "arm64-v8a" => Self::Arm64V8a,
            "armeabi-v7a" => Self::ArmV7a,
            "x86" => Self::X86,
            "x86_64" => Self::X86_64,
            _ => return None,
        })
    }

    pub fn is_64_bit(self) -> bool {
        matches!(self, Self::Arm64V8a | Self::X86_64)
    }

    /// ABIs a CPU of this architecture runs, preferred first.
    fn compatible(arch: &str) -> &'static [Target] {
        match arch {
            "aarch64" => &[Self::Arm64V8a, Self::ArmV7a],
            "arm" => &[Self::ArmV7a],
            "x86_64" => &[Self::X86_64, Self::X86],
            "x86" => &[Self::X86],
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AbiInfo {
    pub supported: Vec<String>,
    pub abis32: Vec<String>,
    pub abis64: Vec<String>,
    pub is_64_bit: bool,
}

impl AbiInfo {
    /// Splits an ordered ABI list into 32 and 64 bit groups. Unknown ABIs
    /// (`armeabi`, `mips`) count as 32 bit.
    pub fn from_supported(supported: Vec<String>) -> Self {
        let (abis64, abis32): (Vec<String>, Vec<String>) = supported
            .iter()
            .cloned()
            .partition(|abi| Target::from_abi(abi).map(Target::is_64_bit).unwrap_or(false));
        Self {
            is_64_bit: !abis64.is_empty(),
            supported,
            abis32,
            abis64,
        }
    }
}

pub fn supported_abis() -> Vec<String> {
    #[cfg(target_os = "android")]
    {
        match crate::android::abi::supported_abis() {
            Ok(abis) => return abis,
            Err(err) => tracing::warn!("Build.SUPPORTED_ABIS unavailable: {:#}", err),
        }
    }
    Target::compatible(std::env::consts::ARCH)
        .iter()
        .map(|t| t.as_str().to_string())
        .collect()
}

pub fn abi_info() -> AbiInfo {
    AbiInfo::from_supported(supported_abis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_split_abis_by_width() {
        let info = AbiInfo::from_supported(vec![
            "arm64-v8a".into(),
            "armeabi-v7a".into(),
            "armeabi".into(),
        ]);
        assert_eq!(info.abis64, vec!["arm64-v8a"]);
        assert_eq!(info.abis32, vec!["armeabi-v7a", "armeabi"]);
        assert!(info.is_64_bit);
    }

    #[test]
    fn should_report_host_abis_consistently() {
        let info = abi_info();
        assert_eq!(info.supported.len(), info.abis32.len() + info.abis64.len());
        assert_eq!(info.is_64_bit, !info.abis64.is_empty());
    }
}
