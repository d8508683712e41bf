//! Permissioned virtual filesystem.
//!
//! Both backends keep the same node model and expose it through the async
//! [`FileSystem`] contract; callers never see which one is mounted.

mod memory;
pub mod path;
mod perm;
mod store;
mod tree;

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

pub use memory::MemoryFs;
pub use perm::{Access, Credentials, Mode};
pub use store::{KvStore, MemoryKvStore, StoreFs};
pub use tree::FsTree;

pub const PROC_ROOT: &str = "/proc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
        }
    }
}

/// Open mode parsed from the `r`/`w`/`a` family of flag strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn parse(flags: &str) -> KernelResult<Self> {
        let parsed = match flags {
            "r" => Self::read_only(),
            "r+" => Self {
                read: true,
                write: true,
                ..Self::default()
            },
            "w" => Self {
                write: true,
                create: true,
                truncate: true,
                ..Self::default()
            },
            "w+" => Self {
                read: true,
                write: true,
                create: true,
                truncate: true,
                ..Self::default()
            },
            "a" => Self {
                write: true,
                append: true,
                create: true,
                ..Self::default()
            },
            "a+" => Self {
                read: true,
                write: true,
                append: true,
                create: true,
                ..Self::default()
            },
            other => return Err(KernelError::invalid(format!("bad open flags: {other}"))),
        };
        Ok(parsed)
    }

    pub fn as_str(&self) -> &'static str {
        match (self.read, self.write, self.append, self.truncate) {
            (true, false, _, _) => "r",
            (true, true, true, _) => "a+",
            (true, true, false, true) => "w+",
            (true, true, false, false) => "r+",
            (false, _, true, _) => "a",
            _ => "w",
        }
    }

    pub fn writes(&self) -> bool {
        self.write || self.append
    }
}

/// Source a synthetic node renders from. The kernel resolves these against
/// the live process table at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum VirtualSource {
    ProcStatus { pid: u32 },
    ProcCmdline { pid: u32 },
    ProcFd { pid: u32, fd: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    File(Vec<u8>),
    Directory,
    Virtual(VirtualSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsNode {
    pub path: String,
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
    pub created: u64,
    pub modified: u64,
    pub content: NodeContent,
}

impl FsNode {
    pub fn directory(path: impl Into<String>, mode: Mode, cred: Credentials, now: u64) -> Self {
        Self {
            path: path.into(),
            mode,
            uid: cred.uid,
            gid: cred.gid,
            created: now,
            modified: now,
            content: NodeContent::Directory,
        }
    }

    pub fn file(
        path: impl Into<String>,
        data: Vec<u8>,
        mode: Mode,
        cred: Credentials,
        now: u64,
    ) -> Self {
        Self {
            path: path.into(),
            mode,
            uid: cred.uid,
            gid: cred.gid,
            created: now,
            modified: now,
            content: NodeContent::File(data),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.content {
            NodeContent::Directory => NodeKind::Directory,
            NodeContent::File(_) | NodeContent::Virtual(_) => NodeKind::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, NodeContent::Directory)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.content, NodeContent::Virtual(_))
    }

    pub fn size(&self) -> usize {
        match &self.content {
            NodeContent::File(data) => data.len(),
            NodeContent::Directory | NodeContent::Virtual(_) => 0,
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            path: self.path.clone(),
            name: path::file_name(&self.path).to_string(),
            kind: self.kind(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size(),
            created: self.created,
            modified: self.modified,
            is_virtual: self.is_virtual(),
        }
    }
}

/// Metadata view of a node handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
    pub size: usize,
    pub created: u64,
    pub modified: u64,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Stored(Vec<u8>),
    Virtual(VirtualSource),
}

/// One entry of a mountable image. `data == None` marks a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
    pub data: Option<Vec<u8>>,
}

/// A detached tree that `mount` grafts under a path. Keys are absolute
/// paths relative to the image root; `/` is the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FsImage {
    entries: BTreeMap<String, ImageEntry>,
}

impl FsImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(mut self, path: &str, mode: u16) -> Self {
        self.entries.insert(
            path.to_string(),
            ImageEntry {
                mode: Mode::new(mode),
                uid: 0,
                gid: 0,
                data: None,
            },
        );
        self
    }

    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>, mode: u16) -> Self {
        self.entries.insert(
            path.to_string(),
            ImageEntry {
                mode: Mode::new(mode),
                uid: 0,
                gid: 0,
                data: Some(data.into()),
            },
        );
        self
    }

    pub fn insert(&mut self, path: String, entry: ImageEntry) {
        self.entries.insert(path, entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &ImageEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the syscall form of an image: an object mapping paths to a
    /// string (file text), `null` (directory) or `{"base64": .., "mode": ..}`.
    pub fn from_json(value: &serde_json::Value) -> KernelResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| KernelError::invalid("mount image must be an object"))?;

        let mut image = FsImage::new();
        for (raw_path, entry) in object {
            let path = path::normalize(raw_path)?;
            let parsed = match entry {
                serde_json::Value::Null => ImageEntry {
                    mode: Mode::DIR_DEFAULT,
                    uid: 0,
                    gid: 0,
                    data: None,
                },
                serde_json::Value::String(text) => ImageEntry {
                    mode: Mode::FILE_DEFAULT,
                    uid: 0,
                    gid: 0,
                    data: Some(text.as_bytes().to_vec()),
                },
                serde_json::Value::Object(fields) => {
                    let mode = fields
                        .get("mode")
                        .and_then(|m| m.as_u64())
                        .map(|m| Mode::new(m as u16));
                    let data = match fields.get("base64").and_then(|b| b.as_str()) {
                        Some(encoded) => Some(
                            BASE64
                                .decode(encoded)
                                .map_err(|err| KernelError::invalid(err.to_string()))?,
                        ),
                        None => fields
                            .get("data")
                            .and_then(|d| d.as_str())
                            .map(|d| d.as_bytes().to_vec()),
                    };
                    let default_mode = if data.is_some() {
                        Mode::FILE_DEFAULT
                    } else {
                        Mode::DIR_DEFAULT
                    };
                    ImageEntry {
                        mode: mode.unwrap_or(default_mode),
                        uid: 0,
                        gid: 0,
                        data,
                    }
                }
                other => {
                    return Err(KernelError::invalid(format!(
                        "unsupported image entry for {path}: {other}"
                    )))
                }
            };
            image.insert(path, parsed);
        }
        Ok(image)
    }
}

/// Bookkeeping for one active mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub path: String,
    /// Paths created by the mount, parents before children.
    pub introduced: Vec<String>,
    /// Nodes that existed at the mount point and were overlaid.
    pub shadowed: Vec<FsNode>,
}

/// Complete persistable state of a tree, `/proc` excluded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FsState {
    pub nodes: BTreeMap<String, FsNode>,
    pub mounts: Vec<MountRecord>,
    pub clock: u64,
}

/// The filesystem contract the kernel talks to.
///
/// Paths are absolute; callers resolve relative paths against a cwd first.
#[async_trait(?Send)]
pub trait FileSystem {
    fn backend(&self) -> &'static str;

    async fn open(&mut self, path: &str, flags: OpenFlags, cred: Credentials)
        -> KernelResult<NodeInfo>;
    async fn read(&self, path: &str) -> KernelResult<FileContent>;
    /// Replace a file's contents, creating it when the parent exists.
    async fn write(&mut self, path: &str, data: &[u8], cred: Credentials) -> KernelResult<usize>;
    async fn write_at(&mut self, path: &str, offset: usize, data: &[u8]) -> KernelResult<usize>;
    async fn append(&mut self, path: &str, data: &[u8]) -> KernelResult<usize>;
    async fn create_file(
        &mut self,
        path: &str,
        data: &[u8],
        mode: Mode,
        cred: Credentials,
    ) -> KernelResult<NodeInfo>;
    async fn mkdir(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<NodeInfo>;
    async fn readdir(&self, path: &str, cred: Credentials) -> KernelResult<Vec<NodeInfo>>;
    async fn unlink(&mut self, path: &str, cred: Credentials) -> KernelResult<()>;
    async fn rename(&mut self, old: &str, new: &str, cred: Credentials) -> KernelResult<()>;
    async fn chmod(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<()>;
    async fn mount(&mut self, image: &FsImage, path: &str) -> KernelResult<usize>;
    async fn unmount(&mut self, path: &str) -> KernelResult<()>;
    async fn stat(&self, path: &str) -> KernelResult<NodeInfo>;
    async fn exists(&self, path: &str) -> bool;
    async fn insert_virtual(&mut self, path: &str, source: VirtualSource) -> KernelResult<()>;
    async fn remove_tree(&mut self, path: &str) -> KernelResult<()>;
    async fn image(&self) -> FsImage;
    async fn export(&self) -> FsState;
    async fn import(&mut self, state: FsState) -> KernelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_parse_the_fopen_family() {
        let read = OpenFlags::parse("r").expect("r");
        assert!(read.read && !read.writes());

        let write = OpenFlags::parse("w").expect("w");
        assert!(write.create && write.truncate && !write.read);

        let append = OpenFlags::parse("a+").expect("a+");
        assert!(append.append && append.read && append.create);
        assert_eq!(append.as_str(), "a+");

        assert_eq!(
            OpenFlags::parse("x").unwrap_err().errno_name(),
            "EINVAL"
        );
    }

    #[test]
    fn image_parses_text_directories_and_base64() {
        let image = FsImage::from_json(&serde_json::json!({
            "/docs": null,
            "/docs/readme.txt": "hello",
            "/blob.bin": {"base64": "AAEC", "mode": 0o600},
        }))
        .expect("parse image");

        let entries: BTreeMap<&str, _> = image
            .entries()
            .map(|(path, entry)| (path.as_str(), entry))
            .collect();
        assert_eq!(entries["/docs"].data, None);
        assert_eq!(
            entries["/docs/readme.txt"].data.as_deref(),
            Some(&b"hello"[..])
        );
        assert_eq!(entries["/blob.bin"].data.as_deref(), Some(&[0u8, 1, 2][..]));
        assert_eq!(entries["/blob.bin"].mode.bits(), 0o600);
    }

    #[test]
    fn node_info_reports_kind_and_size() {
        let node = FsNode::file("/tmp/a.txt", b"hi".to_vec(), Mode::FILE_DEFAULT, Credentials::ROOT, 3);
        let info = node.info();
        assert_eq!(info.name, "a.txt");
        assert_eq!(info.kind, NodeKind::File);
        assert_eq!(info.size, 2);
        assert!(!info.is_virtual);
    }
}
