//! IPC memory handle value type

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Size of a driver IPC memory handle in bytes
pub const IPC_HANDLE_SIZE: usize = 64;

/// Length of the hex text form of a handle
pub const IPC_HANDLE_HEX_LEN: usize = IPC_HANDLE_SIZE * 2;

/// Opaque handle naming a device allocation, exchangeable between processes.
///
/// The payload belongs to the driver and is only ever copied. Equal handles
/// name the same allocation, which may no longer exist.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct IpcHandle {
    reserved: [u8; IPC_HANDLE_SIZE],
}

impl IpcHandle {
    /// Wrap raw handle bytes
    pub const fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self { reserved: bytes }
    }

    /// Raw handle bytes
    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.reserved
    }

    /// Hex text form used for out-of-band transmission
    pub fn to_hex(&self) -> String {
        hex::encode(self.reserved)
    }

    /// Parse the 128 character hex form, either case
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != IPC_HANDLE_HEX_LEN {
            return Err(Error::InvalidHandle(format!(
                "expected {} hex characters, got {}",
                IPC_HANDLE_HEX_LEN,
                s.len()
            )));
        }
        let mut reserved = [0u8; IPC_HANDLE_SIZE];
        hex::decode_to_slice(s, &mut reserved).map_err(|e| Error::InvalidHandle(e.to_string()))?;
        Ok(Self { reserved })
    }
}

impl Default for IpcHandle {
    fn default() -> Self {
        Self {
            reserved: [0u8; IPC_HANDLE_SIZE],
        }
    }
}

impl From<[u8; IPC_HANDLE_SIZE]> for IpcHandle {
    fn from(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for IpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcHandle({})", self.to_hex())
    }
}

impl FromStr for IpcHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IpcHandle {
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        IpcHandle::from_bytes(bytes)
    }

    #[test]
    fn test_hex_form_is_128_lowercase_chars() {
        let text = sample().to_string();
        assert_eq!(text.len(), IPC_HANDLE_HEX_LEN);
        assert!(text.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let handle = sample();
        let parsed: IpcHandle = handle.to_string().parse().unwrap();
        assert_eq!(parsed, handle);

        let text = "00ff".repeat(IPC_HANDLE_HEX_LEN / 4);
        assert_eq!(IpcHandle::from_hex(&text).unwrap().to_hex(), text);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let handle = sample();
        let upper = handle.to_hex().to_uppercase();
        assert_eq!(IpcHandle::from_hex(&upper).unwrap(), handle);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(matches!(
            IpcHandle::from_hex("abcd"),
            Err(Error::InvalidHandle(_))
        ));
        let long = "0".repeat(IPC_HANDLE_HEX_LEN + 2);
        assert!(IpcHandle::from_hex(&long).is_err());
    }

    #[test]
    fn test_parse_rejects_separators_and_non_hex() {
        let mut text = sample().to_hex();
        text.replace_range(10..11, "g");
        assert!(matches!(
            IpcHandle::from_hex(&text),
            Err(Error::InvalidHandle(_))
        ));

        let spaced = format!(" {}", &sample().to_hex()[1..]);
        assert!(IpcHandle::from_hex(&spaced).is_err());
    }

    #[test]
    fn test_equality_is_bytewise() {
        let a = sample();
        let mut bytes = *a.as_bytes();
        assert_eq!(IpcHandle::from(bytes), a);
        bytes[63] ^= 1;
        assert_ne!(IpcHandle::from(bytes), a);
    }
}
