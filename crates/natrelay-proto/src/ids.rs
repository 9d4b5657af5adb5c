//! Identity newtypes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client identity, a 16-bit value where 0 means "not assigned yet"
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u16);

impl ClientId {
    pub const UNASSIGNED: ClientId = ClientId(0);

    pub fn is_unassigned(&self) -> bool {
        self.0 == 0
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ClientId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// App identity, unique within one client
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AppId(pub u8);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for AppId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}
