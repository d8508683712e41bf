use std::collections::BTreeMap;

use crate::clock::DeterministicClock;
use crate::error::{KernelError, KernelResult};

use super::path;
use super::{
    Access, Credentials, FileContent, FsImage, FsNode, FsState, ImageEntry, Mode, MountRecord,
    NodeContent, NodeInfo, OpenFlags, VirtualSource, PROC_ROOT,
};

/// A single node-level mutation, recorded when journaling is enabled so a
/// durable backend can replay it into its store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Put(FsNode),
    Remove(String),
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Put(node) => &node.path,
            Change::Remove(path) => path,
        }
    }
}

/// Inverse of one mutation, kept while journaling so a failed store
/// transaction can be unwound without copying the tree.
#[derive(Debug, Clone)]
enum Undo {
    Node { path: String, previous: Option<FsNode> },
    MountPushed,
    MountRemoved { index: usize, record: MountRecord },
    Mounts(Vec<MountRecord>),
}

/// Point to return to with [`FsTree::rewind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    clock: u64,
}

/// Flat path-keyed node tree shared by both filesystem backends.
///
/// Children are found by range-scanning the ordered map, so a directory
/// never holds a separate child list that could drift from the nodes.
#[derive(Debug, Clone)]
pub struct FsTree {
    nodes: BTreeMap<String, FsNode>,
    mounts: Vec<MountRecord>,
    clock: DeterministicClock,
    journal: Option<Vec<Change>>,
    undo: Vec<Undo>,
}

impl Default for FsTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FsTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            FsNode::directory("/", Mode::DIR_DEFAULT, Credentials::ROOT, 0),
        );
        Self {
            nodes,
            mounts: Vec::new(),
            clock: DeterministicClock::new(),
            journal: None,
            undo: Vec::new(),
        }
    }

    pub fn journaled() -> Self {
        let mut tree = Self::new();
        tree.journal = Some(Vec::new());
        tree
    }

    pub fn take_journal(&mut self) -> Vec<Change> {
        self.journal.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Start a new undo window. Only journaled trees record one.
    pub fn checkpoint(&mut self) -> Checkpoint {
        self.undo.clear();
        Checkpoint {
            clock: self.clock.now(),
        }
    }

    /// Drop the undo window once its changes are durable.
    pub fn settle(&mut self) {
        self.undo.clear();
    }

    /// Clock or mount table moved since `checkpoint`.
    pub fn meta_changed(&self, checkpoint: &Checkpoint) -> bool {
        self.clock.now() != checkpoint.clock
            || self
                .undo
                .iter()
                .any(|undo| !matches!(undo, Undo::Node { .. }))
    }

    /// Undo everything since `checkpoint`, newest first, and discard the
    /// pending journal.
    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Node { path, previous } => match previous {
                    Some(node) => {
                        self.nodes.insert(path, node);
                    }
                    None => {
                        self.nodes.remove(&path);
                    }
                },
                Undo::MountPushed => {
                    self.mounts.pop();
                }
                Undo::MountRemoved { index, record } => self.mounts.insert(index, record),
                Undo::Mounts(previous) => self.mounts = previous,
            }
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.clear();
        }
        self.clock = DeterministicClock::starting_at(checkpoint.clock);
    }

    fn record_undo(&mut self, undo: Undo) {
        if self.journal.is_some() {
            self.undo.push(undo);
        }
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    pub fn mounts(&self) -> &[MountRecord] {
        &self.mounts
    }

    pub fn get(&self, path: &str) -> Option<&FsNode> {
        self.nodes.get(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn put(&mut self, node: FsNode) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(Change::Put(node.clone()));
        }
        let path = node.path.clone();
        let previous = self.nodes.insert(path.clone(), node);
        self.record_undo(Undo::Node { path, previous });
    }

    fn remove(&mut self, path: &str) -> Option<FsNode> {
        let removed = self.nodes.remove(path);
        if let Some(node) = &removed {
            if let Some(journal) = self.journal.as_mut() {
                journal.push(Change::Remove(path.to_string()));
            }
            self.record_undo(Undo::Node {
                path: path.to_string(),
                previous: Some(node.clone()),
            });
        }
        removed
    }

    fn lookup(&self, path: &str) -> KernelResult<&FsNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| KernelError::NotFound(path.to_string()))
    }

    fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a FsNode> + 'a {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let depth = prefix.len();
        let scan = prefix.clone();
        self.nodes
            .range(scan..)
            .take_while(move |(p, _)| p.starts_with(&prefix))
            .filter(move |(p, _)| p.len() > depth && !p[depth..].contains('/'))
            .map(|(_, node)| node)
    }

    /// `path` itself plus everything beneath it, in path order.
    fn subtree(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|candidate| path::is_under(candidate, path))
            .cloned()
            .collect()
    }

    fn require_parent(&self, path: &str, cred: Credentials) -> KernelResult<()> {
        let parent =
            path::parent(path).ok_or_else(|| KernelError::AlreadyExists(path.to_string()))?;
        let node = self
            .nodes
            .get(parent)
            .ok_or_else(|| KernelError::NotFound(parent.to_string()))?;
        if !node.is_dir() {
            return Err(KernelError::NotDirectory(parent.to_string()));
        }
        if !node.mode.allows(cred, node.uid, node.gid, Access::Write) {
            return Err(KernelError::PermissionDenied(parent.to_string()));
        }
        Ok(())
    }

    fn touch_parent(&mut self, path: &str, now: u64) {
        let Some(parent) = path::parent(path) else {
            return;
        };
        if let Some(mut node) = self.nodes.get(parent).cloned() {
            node.modified = now;
            self.put(node);
        }
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags, cred: Credentials) -> KernelResult<NodeInfo> {
        let path = path::normalize(path)?;

        if !self.nodes.contains_key(&path) {
            if !flags.create {
                return Err(KernelError::NotFound(path));
            }
            self.require_parent(&path, cred)?;
            let now = self.clock.tick();
            let node = FsNode::file(&path, Vec::new(), Mode::FILE_DEFAULT, cred, now);
            let info = node.info();
            self.put(node);
            self.touch_parent(&path, now);
            return Ok(info);
        }

        let node = self.lookup(&path)?;
        if node.is_dir() {
            return Err(KernelError::IsDirectory(path));
        }
        if flags.read && !node.mode.allows(cred, node.uid, node.gid, Access::Read) {
            return Err(KernelError::PermissionDenied(path));
        }
        if flags.writes()
            && (node.is_virtual() || !node.mode.allows(cred, node.uid, node.gid, Access::Write))
        {
            return Err(KernelError::PermissionDenied(path));
        }

        if flags.truncate && node.size() > 0 {
            let mut updated = node.clone();
            updated.content = NodeContent::File(Vec::new());
            updated.modified = self.clock.tick();
            let info = updated.info();
            self.put(updated);
            return Ok(info);
        }
        Ok(node.info())
    }

    pub fn read(&self, path: &str) -> KernelResult<FileContent> {
        let path = path::normalize(path)?;
        match &self.lookup(&path)?.content {
            NodeContent::File(data) => Ok(FileContent::Stored(data.clone())),
            NodeContent::Virtual(source) => Ok(FileContent::Virtual(source.clone())),
            NodeContent::Directory => Err(KernelError::IsDirectory(path)),
        }
    }

    pub fn write(&mut self, path: &str, data: &[u8], cred: Credentials) -> KernelResult<usize> {
        let path = path::normalize(path)?;
        match self.nodes.get(&path) {
            Some(node) => {
                if node.is_dir() {
                    return Err(KernelError::IsDirectory(path));
                }
                if node.is_virtual() || !node.mode.allows(cred, node.uid, node.gid, Access::Write)
                {
                    return Err(KernelError::PermissionDenied(path));
                }
                let mut updated = node.clone();
                updated.content = NodeContent::File(data.to_vec());
                updated.modified = self.clock.tick();
                self.put(updated);
            }
            None => {
                self.require_parent(&path, cred)?;
                let now = self.clock.tick();
                self.put(FsNode::file(&path, data.to_vec(), Mode::FILE_DEFAULT, cred, now));
                self.touch_parent(&path, now);
            }
        }
        Ok(data.len())
    }

    /// Positional write used by descriptors; permission was checked at open.
    pub fn write_at(&mut self, path: &str, offset: usize, data: &[u8]) -> KernelResult<usize> {
        let path = path::normalize(path)?;
        let node = self.lookup(&path)?;
        let NodeContent::File(existing) = &node.content else {
            return Err(match node.content {
                NodeContent::Directory => KernelError::IsDirectory(path),
                _ => KernelError::PermissionDenied(path),
            });
        };

        let mut content = existing.clone();
        let end = offset + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);

        let mut updated = node.clone();
        updated.content = NodeContent::File(content);
        updated.modified = self.clock.tick();
        self.put(updated);
        Ok(data.len())
    }

    pub fn append(&mut self, path: &str, data: &[u8]) -> KernelResult<usize> {
        let path = path::normalize(path)?;
        let offset = self.lookup(&path)?.size();
        self.write_at(&path, offset, data)
    }

    pub fn create_file(
        &mut self,
        path: &str,
        data: &[u8],
        mode: Mode,
        cred: Credentials,
    ) -> KernelResult<NodeInfo> {
        let path = path::normalize(path)?;
        if self.nodes.contains_key(&path) {
            return Err(KernelError::AlreadyExists(path));
        }
        self.require_parent(&path, cred)?;
        let now = self.clock.tick();
        let node = FsNode::file(&path, data.to_vec(), mode, cred, now);
        let info = node.info();
        self.put(node);
        self.touch_parent(&path, now);
        Ok(info)
    }

    pub fn mkdir(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<NodeInfo> {
        let path = path::normalize(path)?;
        if self.nodes.contains_key(&path) {
            return Err(KernelError::AlreadyExists(path));
        }
        self.require_parent(&path, cred)?;
        let now = self.clock.tick();
        let node = FsNode::directory(&path, mode, cred, now);
        let info = node.info();
        self.put(node);
        self.touch_parent(&path, now);
        Ok(info)
    }

    pub fn readdir(&self, path: &str, cred: Credentials) -> KernelResult<Vec<NodeInfo>> {
        let path = path::normalize(path)?;
        let node = self.lookup(&path)?;
        if !node.is_dir() {
            return Err(KernelError::NotDirectory(path));
        }
        if !node.mode.allows(cred, node.uid, node.gid, Access::Read) {
            return Err(KernelError::PermissionDenied(path));
        }
        Ok(self.children(&path).map(FsNode::info).collect())
    }

    pub fn unlink(&mut self, path: &str, cred: Credentials) -> KernelResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(KernelError::invalid("cannot unlink root"));
        }
        let node = self.lookup(&path)?;
        if node.is_dir() && self.children(&path).next().is_some() {
            return Err(KernelError::NotEmpty(path));
        }
        self.require_parent(&path, cred)?;

        let now = self.clock.tick();
        self.remove(&path);
        self.touch_parent(&path, now);
        Ok(())
    }

    pub fn rename(&mut self, old: &str, new: &str, cred: Credentials) -> KernelResult<()> {
        let old = path::normalize(old)?;
        let new = path::normalize(new)?;
        if old == "/" {
            return Err(KernelError::invalid("cannot rename root"));
        }
        self.lookup(&old)?;
        if self.nodes.contains_key(&new) {
            return Err(KernelError::AlreadyExists(new));
        }
        if path::is_under(&new, &old) {
            return Err(KernelError::invalid(format!("cannot move {old} into itself")));
        }
        self.require_parent(&old, cred)?;
        self.require_parent(&new, cred)?;

        let now = self.clock.tick();
        let moved: Vec<FsNode> = self
            .subtree(&old)
            .iter()
            .filter_map(|p| self.remove(p))
            .collect();
        for mut node in moved {
            node.path = path::rebase(&node.path, &old, &new);
            if node.path == new {
                node.modified = now;
            }
            self.put(node);
        }
        self.touch_parent(&old, now);
        self.touch_parent(&new, now);
        Ok(())
    }

    pub fn chmod(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<()> {
        let path = path::normalize(path)?;
        let node = self.lookup(&path)?;
        if !cred.is_root() && cred.uid != node.uid {
            return Err(KernelError::PermissionDenied(path));
        }
        let mut updated = node.clone();
        updated.mode = mode;
        updated.modified = self.clock.tick();
        self.put(updated);
        Ok(())
    }

    /// Graft `image` under `target`. Every collision is detected before the
    /// first node is written.
    pub fn mount(&mut self, image: &FsImage, target: &str) -> KernelResult<usize> {
        let target = path::normalize(target)?;
        if target == "/" {
            return Err(KernelError::invalid("cannot mount over root"));
        }

        let mut entries: BTreeMap<String, &ImageEntry> = BTreeMap::new();
        for (rel, entry) in image.entries() {
            entries.insert(path::normalize(rel)?, entry);
        }

        let mut plan = Vec::with_capacity(entries.len());
        for (rel, entry) in &entries {
            if rel == "/" {
                continue;
            }
            if let Some(parent) = path::parent(rel) {
                let parent_ok = parent == "/"
                    || entries.get(parent).map_or(false, |p| p.data.is_none());
                if !parent_ok {
                    return Err(KernelError::invalid(format!(
                        "image entry {rel} has no parent directory"
                    )));
                }
            }
            let dest = path::rebase(rel, "/", &target);
            if self.nodes.contains_key(&dest) {
                return Err(KernelError::AlreadyExists(dest));
            }
            plan.push((dest, *entry));
        }

        let existing = self.nodes.get(&target).cloned();
        match &existing {
            Some(node) if !node.is_dir() => return Err(KernelError::NotDirectory(target)),
            Some(_) => {}
            None => {
                let parent = path::parent(&target).unwrap_or("/");
                let parent_node = self.lookup(parent)?;
                if !parent_node.is_dir() {
                    return Err(KernelError::NotDirectory(parent.to_string()));
                }
            }
        }

        let now = self.clock.tick();
        let root = entries.get("/");
        let mut record = MountRecord {
            path: target.clone(),
            introduced: Vec::with_capacity(plan.len() + 1),
            shadowed: Vec::new(),
        };
        let root_node = FsNode {
            path: target.clone(),
            mode: root.map_or(Mode::DIR_DEFAULT, |r| r.mode),
            uid: root.map_or(0, |r| r.uid),
            gid: root.map_or(0, |r| r.gid),
            created: existing.as_ref().map_or(now, |node| node.created),
            modified: now,
            content: NodeContent::Directory,
        };
        match existing {
            Some(previous) => record.shadowed.push(previous),
            None => record.introduced.push(target.clone()),
        }
        self.put(root_node);

        let count = plan.len() + 1;
        for (dest, entry) in plan {
            let content = match &entry.data {
                Some(data) => NodeContent::File(data.clone()),
                None => NodeContent::Directory,
            };
            record.introduced.push(dest.clone());
            self.put(FsNode {
                path: dest,
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                created: now,
                modified: now,
                content,
            });
        }
        self.mounts.push(record);
        self.record_undo(Undo::MountPushed);
        Ok(count)
    }

    pub fn unmount(&mut self, target: &str) -> KernelResult<()> {
        let target = path::normalize(target)?;
        let index = self
            .mounts
            .iter()
            .rposition(|mount| mount.path == target)
            .ok_or_else(|| KernelError::invalid(format!("not mounted: {target}")))?;
        if self.mounts[index + 1..]
            .iter()
            .any(|mount| mount.path != target && path::is_under(&mount.path, &target))
        {
            return Err(KernelError::invalid(format!("mount busy: {target}")));
        }

        let record = self.mounts.remove(index);
        for introduced in record.introduced.iter().rev() {
            for victim in self.subtree(introduced).into_iter().rev() {
                self.remove(&victim);
            }
        }
        for node in record.shadowed.iter().cloned() {
            self.put(node);
        }
        self.record_undo(Undo::MountRemoved { index, record });
        Ok(())
    }

    pub fn stat(&self, path: &str) -> KernelResult<NodeInfo> {
        let path = path::normalize(path)?;
        Ok(self.lookup(&path)?.info())
    }

    pub fn exists(&self, path: &str) -> bool {
        path::normalize(path)
            .map(|p| self.nodes.contains_key(&p))
            .unwrap_or(false)
    }

    /// Register a synthetic node, creating missing parent directories.
    /// Permission checks and the clock are bypassed: these nodes mirror
    /// kernel state rather than user activity.
    pub fn insert_virtual(&mut self, path: &str, source: VirtualSource) -> KernelResult<()> {
        let path = path::normalize(path)?;

        let mut missing = Vec::new();
        let mut cursor = path::parent(&path);
        while let Some(dir) = cursor {
            match self.nodes.get(dir) {
                Some(node) if node.is_dir() => break,
                Some(_) => return Err(KernelError::NotDirectory(dir.to_string())),
                None => missing.push(dir.to_string()),
            }
            cursor = path::parent(dir);
        }

        let now = self.clock.now();
        for dir in missing.into_iter().rev() {
            self.put(FsNode::directory(dir, Mode::VIRTUAL_DIR, Credentials::ROOT, now));
        }
        self.put(FsNode {
            path,
            mode: Mode::VIRTUAL,
            uid: 0,
            gid: 0,
            created: now,
            modified: now,
            content: NodeContent::Virtual(source),
        });
        Ok(())
    }

    pub fn remove_tree(&mut self, path: &str) -> KernelResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(KernelError::invalid("cannot remove root"));
        }
        for victim in self.subtree(&path).into_iter().rev() {
            self.remove(&victim);
        }
        Ok(())
    }

    pub fn image(&self) -> FsImage {
        let mut image = FsImage::new();
        for node in self.nodes.values() {
            if path::is_under(&node.path, PROC_ROOT) {
                continue;
            }
            let data = match &node.content {
                NodeContent::File(data) => Some(data.clone()),
                NodeContent::Directory => None,
                NodeContent::Virtual(_) => continue,
            };
            image.insert(
                node.path.clone(),
                ImageEntry {
                    mode: node.mode,
                    uid: node.uid,
                    gid: node.gid,
                    data,
                },
            );
        }
        image
    }

    pub fn export(&self) -> FsState {
        FsState {
            nodes: self
                .nodes
                .iter()
                .filter(|(p, _)| !is_proc_entry(p))
                .map(|(p, node)| (p.clone(), node.clone()))
                .collect(),
            mounts: self.mounts.clone(),
            clock: self.clock.now(),
        }
    }

    pub fn import(&mut self, state: FsState) -> KernelResult<()> {
        if !state.nodes.get("/").map_or(false, FsNode::is_dir) {
            return Err(KernelError::invalid("filesystem state has no root directory"));
        }
        let stale: Vec<String> = self.nodes.keys().cloned().collect();
        for path in stale {
            self.remove(&path);
        }
        for (_, node) in state.nodes {
            self.put(node);
        }
        let previous = std::mem::replace(&mut self.mounts, state.mounts);
        self.record_undo(Undo::Mounts(previous));
        self.clock = DeterministicClock::starting_at(state.clock);
        Ok(())
    }
}

/// Strict descendants of `/proc`; the directory itself is ordinary.
pub fn is_proc_entry(path: &str) -> bool {
    path != PROC_ROOT && path::is_under(path, PROC_ROOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_tmp() -> FsTree {
        let mut tree = FsTree::new();
        tree.mkdir("/tmp", Mode::new(0o755), Credentials::ROOT)
            .expect("mkdir /tmp");
        tree
    }

    #[test]
    fn create_then_read_file() {
        let mut tree = tree_with_tmp();
        tree.create_file("/tmp/a.txt", b"hi", Mode::new(0o644), Credentials::ROOT)
            .expect("create");
        assert_eq!(
            tree.read("/tmp/a.txt").expect("read"),
            FileContent::Stored(b"hi".to_vec())
        );
        assert_eq!(
            tree.create_file("/tmp/a.txt", b"", Mode::FILE_DEFAULT, Credentials::ROOT)
                .unwrap_err()
                .errno_name(),
            "EEXIST"
        );
    }

    #[test]
    fn mkdir_requires_existing_directory_parent() {
        let mut tree = tree_with_tmp();
        let missing = tree
            .mkdir("/nope/child", Mode::DIR_DEFAULT, Credentials::ROOT)
            .unwrap_err();
        assert_eq!(missing.errno_name(), "ENOENT");

        tree.write("/tmp/file", b"x", Credentials::ROOT).expect("write");
        let under_file = tree
            .mkdir("/tmp/file/child", Mode::DIR_DEFAULT, Credentials::ROOT)
            .unwrap_err();
        assert_eq!(under_file.errno_name(), "ENOTDIR");
    }

    #[test]
    fn non_empty_directory_cannot_be_unlinked() {
        let mut tree = tree_with_tmp();
        tree.mkdir("/tmp/d", Mode::DIR_DEFAULT, Credentials::ROOT).expect("mkdir");
        tree.write("/tmp/d/f", b"1", Credentials::ROOT).expect("write");

        assert_eq!(
            tree.unlink("/tmp/d", Credentials::ROOT).unwrap_err().errno_name(),
            "ENOTEMPTY"
        );
        tree.unlink("/tmp/d/f", Credentials::ROOT).expect("unlink child");
        tree.unlink("/tmp/d", Credentials::ROOT).expect("unlink dir");
        assert!(!tree.exists("/tmp/d"));
    }

    #[test]
    fn open_checks_mode_bits_for_non_root() {
        let mut tree = tree_with_tmp();
        tree.create_file("/tmp/secret", b"k", Mode::new(0o600), Credentials::ROOT)
            .expect("create");

        let user = Credentials::new(1000, 1000);
        let denied = tree.open("/tmp/secret", OpenFlags::read_only(), user).unwrap_err();
        assert_eq!(denied.errno_name(), "EACCES");
        tree.open("/tmp/secret", OpenFlags::read_only(), Credentials::ROOT)
            .expect("root bypasses");
    }

    #[test]
    fn open_directory_is_eisdir() {
        let mut tree = tree_with_tmp();
        let err = tree
            .open("/tmp", OpenFlags::read_only(), Credentials::ROOT)
            .unwrap_err();
        assert_eq!(err.errno_name(), "EISDIR");
    }

    #[test]
    fn creating_needs_write_on_parent() {
        let mut tree = FsTree::new();
        tree.mkdir("/etc", Mode::new(0o755), Credentials::ROOT).expect("mkdir");
        let err = tree
            .write("/etc/passwd", b"x", Credentials::new(1000, 1000))
            .unwrap_err();
        assert_eq!(err.errno_name(), "EACCES");
    }

    #[test]
    fn write_at_extends_and_append_adds_to_end() {
        let mut tree = tree_with_tmp();
        tree.write("/tmp/f", b"abc", Credentials::ROOT).expect("write");
        tree.write_at("/tmp/f", 1, b"XY").expect("write_at");
        tree.append("/tmp/f", b"!").expect("append");
        assert_eq!(
            tree.read("/tmp/f").expect("read"),
            FileContent::Stored(b"aXY!".to_vec())
        );
    }

    #[test]
    fn mutations_stamp_logical_time() {
        let mut tree = tree_with_tmp();
        let first = tree.stat("/tmp").expect("stat").modified;
        tree.write("/tmp/f", b"1", Credentials::ROOT).expect("write");
        let file = tree.stat("/tmp/f").expect("stat");
        assert!(file.modified > first);
        assert_eq!(tree.stat("/tmp").expect("stat").modified, file.modified);
    }

    #[test]
    fn rename_moves_whole_subtree() {
        let mut tree = tree_with_tmp();
        tree.mkdir("/tmp/a", Mode::DIR_DEFAULT, Credentials::ROOT).expect("mkdir");
        tree.write("/tmp/a/f", b"1", Credentials::ROOT).expect("write");

        tree.rename("/tmp/a", "/tmp/b", Credentials::ROOT).expect("rename");
        assert!(!tree.exists("/tmp/a"));
        assert_eq!(
            tree.read("/tmp/b/f").expect("read"),
            FileContent::Stored(b"1".to_vec())
        );
    }

    #[test]
    fn rename_rejects_existing_target_and_self_nesting() {
        let mut tree = tree_with_tmp();
        tree.mkdir("/tmp/a", Mode::DIR_DEFAULT, Credentials::ROOT).expect("mkdir");
        tree.write("/tmp/b", b"", Credentials::ROOT).expect("write");

        assert_eq!(
            tree.rename("/tmp/a", "/tmp/b", Credentials::ROOT)
                .unwrap_err()
                .errno_name(),
            "EEXIST"
        );
        assert_eq!(
            tree.rename("/tmp/a", "/tmp/a/inner", Credentials::ROOT)
                .unwrap_err()
                .errno_name(),
            "EINVAL"
        );
    }

    #[test]
    fn unmount_restores_tree_exactly() {
        let mut tree = FsTree::new();
        tree.mkdir("/mnt", Mode::DIR_DEFAULT, Credentials::ROOT).expect("mkdir");
        tree.write("/mnt/existing.txt", b"keep", Credentials::ROOT).expect("write");
        let before = tree.export().nodes;

        let image = FsImage::new()
            .with_file("/foo.txt", "mounted", 0o644)
            .with_dir("/sub", 0o755)
            .with_file("/sub/deep.txt", "deep", 0o644);
        assert_eq!(tree.mount(&image, "/mnt").expect("mount"), 4);
        assert!(tree.exists("/mnt/foo.txt"));
        assert!(tree.exists("/mnt/sub/deep.txt"));

        tree.unmount("/mnt").expect("unmount");
        assert_eq!(tree.export().nodes, before);
    }

    #[test]
    fn mount_collision_writes_nothing() {
        let mut tree = FsTree::new();
        tree.mkdir("/mnt", Mode::DIR_DEFAULT, Credentials::ROOT).expect("mkdir");
        tree.write("/mnt/foo.txt", b"mine", Credentials::ROOT).expect("write");
        let before = tree.export();

        let image = FsImage::new()
            .with_file("/a.txt", "a", 0o644)
            .with_file("/foo.txt", "theirs", 0o644);
        assert_eq!(tree.mount(&image, "/mnt").unwrap_err().errno_name(), "EEXIST");
        assert_eq!(tree.export(), before);
    }

    #[test]
    fn unmount_without_mount_is_einval() {
        let mut tree = FsTree::new();
        assert_eq!(tree.unmount("/mnt").unwrap_err().errno_name(), "EINVAL");
    }

    #[test]
    fn unmount_removes_files_created_inside_mounted_dirs() {
        let mut tree = FsTree::new();
        let image = FsImage::new().with_dir("/data", 0o777);
        tree.mount(&image, "/vol").expect("mount");
        tree.write("/vol/data/new.txt", b"x", Credentials::ROOT).expect("write");

        tree.unmount("/vol").expect("unmount");
        assert!(!tree.exists("/vol"));
        assert!(!tree.exists("/vol/data/new.txt"));
    }

    #[test]
    fn virtual_nodes_are_not_exported() {
        let mut tree = FsTree::new();
        tree.mkdir("/proc", Mode::VIRTUAL_DIR, Credentials::ROOT).expect("mkdir");
        let clock = tree.clock();
        tree.insert_virtual("/proc/1/status", VirtualSource::ProcStatus { pid: 1 })
            .expect("insert");

        assert_eq!(tree.clock(), clock);
        assert!(tree.exists("/proc/1"));
        assert_eq!(
            tree.read("/proc/1/status").expect("read"),
            FileContent::Virtual(VirtualSource::ProcStatus { pid: 1 })
        );
        let exported = tree.export();
        assert!(exported.nodes.contains_key("/proc"));
        assert!(!exported.nodes.contains_key("/proc/1"));

        tree.remove_tree("/proc/1").expect("remove");
        assert!(!tree.exists("/proc/1/status"));
    }

    #[test]
    fn journal_records_node_changes() {
        let mut tree = FsTree::journaled();
        tree.write("/f", b"1", Credentials::ROOT).expect("write");
        let changes = tree.take_journal();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path(), "/f");
        assert_eq!(changes[1].path(), "/");
        assert!(tree.take_journal().is_empty());
    }

    #[test]
    fn rewind_restores_nodes_mounts_and_clock() {
        let mut tree = FsTree::journaled();
        tree.mkdir("/mnt", Mode::DIR_DEFAULT, Credentials::ROOT)
            .expect("mkdir");
        tree.write("/mnt/old", b"kept", Credentials::ROOT).expect("write");
        tree.take_journal();
        let before = tree.export();

        let checkpoint = tree.checkpoint();
        tree.write("/mnt/old", b"changed", Credentials::ROOT)
            .expect("write");
        tree.mount(&FsImage::new().with_file("/new", "x", 0o644), "/mnt")
            .expect("mount");
        tree.unlink("/mnt/old", Credentials::ROOT).expect("unlink");
        assert!(tree.meta_changed(&checkpoint));
        tree.rewind(checkpoint);

        assert_eq!(tree.export(), before);
        assert!(!tree.exists("/mnt/new"));
        assert!(tree.take_journal().is_empty());
    }
}
