use std::fmt;

use serde::{Deserialize, Serialize};

/// Retention hint carried by every chunk, bits 15..14 of the entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Ephemeral = 0,
    System = 1,
    #[default]
    User = 2,
    Pinned = 3,
}

impl Importance {
    pub fn from_bits(bits: u8) -> Importance {
        match bits & 0b11 {
            0 => Importance::Ephemeral,
            1 => Importance::System,
            2 => Importance::User,
            _ => Importance::Pinned,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Importance::Ephemeral => "ephemeral",
            Importance::System => "system",
            Importance::User => "user",
            Importance::Pinned => "pinned",
        };
        f.write_str(name)
    }
}

/// Packed u16 flags of an index entry.
///
/// | Bits  | Name          |
/// | ----: | ------------- |
/// | 15-14 | importance    |
/// | 13-2  | dictionary id |
/// | 1-0   | reserved      |
///
/// Dictionary id `0` means the payload was compressed without a shared
/// dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u16);

impl EntryFlags {
    pub const MAX_DICT_ID: u16 = 0x0FFF;

    /// `None` when `dict_id` does not fit the 12 bit field.
    pub fn new(importance: Importance, dict_id: u16) -> Option<EntryFlags> {
        if dict_id > Self::MAX_DICT_ID {
            return None;
        }
        Some(EntryFlags(((importance.bits() as u16) << 14) | (dict_id << 2)))
    }

    pub fn from_bits(bits: u16) -> EntryFlags {
        EntryFlags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn importance(self) -> Importance {
        Importance::from_bits((self.0 >> 14) as u8)
    }

    pub fn dict_id(self) -> u16 {
        (self.0 >> 2) & Self::MAX_DICT_ID
    }

    pub fn reserved(self) -> u16 {
        self.0 & 0b11
    }
}
