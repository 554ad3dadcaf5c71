//! Channel identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a logical stream within a session.
///
/// Ids are assigned by whichever side opens the channel: the client
/// allocates even ids starting at 2, the session daemon odd ids starting
/// at 3, so both sides can open channels concurrently without a
/// coordination handshake. Id 0 is reserved for control frames and id 1
/// for the terminal channel, which exists for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Control frames not bound to any channel
    pub const CONTROL: ChannelId = ChannelId(0);

    /// The interactive terminal channel, implicitly open at session start
    pub const TERMINAL: ChannelId = ChannelId(1);

    /// Create a new channel ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this id belongs to the client-side allocation space
    pub fn client_allocated(&self) -> bool {
        self.0 >= 2 && self.0 % 2 == 0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_display() {
        assert_eq!(format!("{}", ChannelId::new(4)), "chan-4");
        assert_eq!(format!("{}", ChannelId::TERMINAL), "chan-1");
    }

    #[test]
    fn test_allocation_spaces() {
        assert!(!ChannelId::CONTROL.client_allocated());
        assert!(!ChannelId::TERMINAL.client_allocated());
        assert!(ChannelId::new(2).client_allocated());
        assert!(!ChannelId::new(3).client_allocated());
        assert!(ChannelId::new(10).client_allocated());
    }
}
