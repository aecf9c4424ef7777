//! Runtime configuration

use crate::flags::IpcMemFlags;
use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable overriding the driver library path
pub const DRIVER_LIBRARY_ENV: &str = "CUIPC_DRIVER_LIBRARY";

/// Environment variable selecting the flags used when opening handles
pub const OPEN_FLAGS_ENV: &str = "CUIPC_OPEN_FLAGS";

/// IPC configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcConfig {
    /// Explicit driver library; `None` uses the per-platform default
    pub driver_library: Option<PathBuf>,
    /// Flags for opening handles
    pub open_flags: IpcMemFlags,
}

impl IpcConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let driver_library = lookup(DRIVER_LIBRARY_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let open_flags = match lookup(OPEN_FLAGS_ENV) {
            Some(v) => parse_open_flags(&v)?,
            None => IpcMemFlags::default(),
        };
        Ok(Self {
            driver_library,
            open_flags,
        })
    }
}

/// Parse `lazy`, `none` or a decimal/hex bit value
pub fn parse_open_flags(value: &str) -> Result<IpcMemFlags> {
    let value = value.trim();
    match value.to_ascii_lowercase().as_str() {
        "lazy" | "lazy_enable_peer_access" => return Ok(IpcMemFlags::LAZY_ENABLE_PEER_ACCESS),
        "none" | "" => return Ok(IpcMemFlags::empty()),
        _ => {}
    }
    let bits = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    }
    .map_err(|_| Error::InvalidConfig(format!("{}: unrecognized flags '{}'", OPEN_FLAGS_ENV, value)))?;
    Ok(IpcMemFlags::from_raw(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = IpcConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, IpcConfig::default());
        assert_eq!(config.open_flags, IpcMemFlags::LAZY_ENABLE_PEER_ACCESS);
    }

    #[test]
    fn test_overrides() {
        let config = IpcConfig::from_lookup(lookup(&[
            (DRIVER_LIBRARY_ENV, "/opt/cuda/lib64/libcuda.so"),
            (OPEN_FLAGS_ENV, "none"),
        ]))
        .unwrap();
        assert_eq!(
            config.driver_library,
            Some(PathBuf::from("/opt/cuda/lib64/libcuda.so"))
        );
        assert!(config.open_flags.is_empty());
    }

    #[test]
    fn test_numeric_flags_drop_reserved_bits() {
        assert_eq!(
            parse_open_flags("0x3").unwrap(),
            IpcMemFlags::LAZY_ENABLE_PEER_ACCESS
        );
        assert_eq!(parse_open_flags("2").unwrap(), IpcMemFlags::empty());
        assert!(matches!(
            parse_open_flags("eager"),
            Err(Error::InvalidConfig(_))
        ));
    }
}
