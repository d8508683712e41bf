//! Permission checking for filesystem nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity a filesystem operation runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };

    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    fn bit(self) -> u16 {
        match self {
            Access::Read => 0o4,
            Access::Write => 0o2,
        }
    }
}

/// Octal permission bits of a node (`0o755` style).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(u16);

impl Mode {
    pub const FILE_DEFAULT: Mode = Mode(0o644);
    pub const DIR_DEFAULT: Mode = Mode(0o755);
    pub const VIRTUAL: Mode = Mode(0o444);
    pub const VIRTUAL_DIR: Mode = Mode(0o555);

    pub fn new(bits: u16) -> Self {
        Self(bits & 0o777)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// The rwx triple that applies to `cred` for a node owned by `uid:gid`.
    pub fn rights_for(&self, cred: Credentials, uid: u32, gid: u32) -> u16 {
        if cred.uid == uid {
            (self.0 >> 6) & 0o7
        } else if cred.gid == gid {
            (self.0 >> 3) & 0o7
        } else {
            self.0 & 0o7
        }
    }

    pub fn allows(&self, cred: Credentials, uid: u32, gid: u32, access: Access) -> bool {
        if cred.is_root() {
            return true;
        }
        self.rights_for(cred, uid, gid) & access.bit() != 0
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#o}", self.0)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}
