//! Flags controlling how an IPC handle is opened

use bitflags::bitflags;

bitflags! {
    /// Options for opening an IPC memory handle.
    ///
    /// Only known bits ever reach the driver; use [`IpcMemFlags::from_raw`]
    /// for values of unknown origin.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IpcMemFlags: u32 {
        /// Defer enabling peer access until the mapping is first used
        const LAZY_ENABLE_PEER_ACCESS = 0x1;
    }
}

impl IpcMemFlags {
    /// Convert raw bits, clearing reserved ones
    pub const fn from_raw(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }
}

impl Default for IpcMemFlags {
    fn default() -> Self {
        IpcMemFlags::LAZY_ENABLE_PEER_ACCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_bits_cleared() {
        let flags = IpcMemFlags::from_raw(0xffff_fff0 | 0x1);
        assert_eq!(flags, IpcMemFlags::LAZY_ENABLE_PEER_ACCESS);
        assert_eq!(IpcMemFlags::from_raw(0x8).bits(), 0);
    }

    #[test]
    fn test_default_is_lazy_peer_access() {
        assert_eq!(IpcMemFlags::default().bits(), 0x1);
    }
}
