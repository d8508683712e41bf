//! Durable-store filesystem backend.
//!
//! Nodes live as JSON records in a [`KvStore`]. The tree is mirrored in
//! memory for reads; each mutation is applied to the mirror first and its
//! node changes are then written in one store transaction. When the store
//! refuses the transaction the mirror is rolled back as well.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

use super::tree::{is_proc_entry, Change};
use super::{
    Credentials, FileContent, FileSystem, FsImage, FsNode, FsState, FsTree, Mode, MountRecord,
    NodeContent, NodeInfo, NodeKind, OpenFlags, VirtualSource,
};

const NODE_PREFIX: &str = "node:";
const META_KEY: &str = "meta";

/// Async key-value store with explicit transactions.
///
/// Writes issued outside `begin`/`commit` apply immediately. Readers only
/// observe committed data.
#[async_trait(?Send)]
pub trait KvStore {
    async fn get(&self, key: &str) -> KernelResult<Option<String>>;
    async fn scan(&self, prefix: &str) -> KernelResult<Vec<(String, String)>>;
    async fn begin(&mut self) -> KernelResult<()>;
    async fn put(&mut self, key: &str, value: String) -> KernelResult<()>;
    async fn delete(&mut self, key: &str) -> KernelResult<()>;
    async fn commit(&mut self) -> KernelResult<()>;
    async fn rollback(&mut self) -> KernelResult<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKvStore {
    committed: BTreeMap<String, String>,
    pending: Option<BTreeMap<String, Option<String>>>,
    fail_next_commit: bool,
    commits: u64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail and discard its transaction.
    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn records(&self) -> &BTreeMap<String, String> {
        &self.committed
    }
}

#[async_trait(?Send)]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> KernelResult<Option<String>> {
        Ok(self.committed.get(key).cloned())
    }

    async fn scan(&self, prefix: &str) -> KernelResult<Vec<(String, String)>> {
        Ok(self
            .committed
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn begin(&mut self) -> KernelResult<()> {
        if self.pending.is_some() {
            return Err(KernelError::store("transaction already open"));
        }
        self.pending = Some(BTreeMap::new());
        Ok(())
    }

    async fn put(&mut self, key: &str, value: String) -> KernelResult<()> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.insert(key.to_string(), Some(value));
            }
            None => {
                self.committed.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> KernelResult<()> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.insert(key.to_string(), None);
            }
            None => {
                self.committed.remove(key);
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> KernelResult<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| KernelError::store("commit without transaction"))?;
        if std::mem::take(&mut self.fail_next_commit) {
            return Err(KernelError::store("commit rejected"));
        }
        for (key, value) in pending {
            match value {
                Some(value) => {
                    self.committed.insert(key, value);
                }
                None => {
                    self.committed.remove(&key);
                }
            }
        }
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> KernelResult<()> {
        self.pending = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNode {
    path: String,
    kind: NodeKind,
    mode: Mode,
    uid: u32,
    gid: u32,
    created: u64,
    modified: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base64: Option<String>,
}

impl StoredNode {
    fn from_node(node: &FsNode) -> KernelResult<Self> {
        let base64 = match &node.content {
            NodeContent::File(data) => Some(BASE64.encode(data)),
            NodeContent::Directory => None,
            NodeContent::Virtual(_) => {
                return Err(KernelError::store(format!(
                    "virtual node {} cannot be persisted",
                    node.path
                )))
            }
        };
        Ok(Self {
            path: node.path.clone(),
            kind: node.kind(),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            created: node.created,
            modified: node.modified,
            base64,
        })
    }

    fn into_node(self) -> KernelResult<FsNode> {
        let content = match self.kind {
            NodeKind::Directory => NodeContent::Directory,
            NodeKind::File => {
                let encoded = self.base64.unwrap_or_default();
                NodeContent::File(
                    BASE64
                        .decode(encoded)
                        .map_err(|err| KernelError::store(err.to_string()))?,
                )
            }
        };
        Ok(FsNode {
            path: self.path,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            created: self.created,
            modified: self.modified,
            content,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMount {
    path: String,
    introduced: Vec<String>,
    shadowed: Vec<StoredNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    clock: u64,
    mounts: Vec<StoredMount>,
}

fn node_key(path: &str) -> String {
    format!("{NODE_PREFIX}{path}")
}

fn encode<T: Serialize>(value: &T) -> KernelResult<String> {
    serde_json::to_string(value).map_err(|err| KernelError::store(err.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> KernelResult<T> {
    serde_json::from_str(text).map_err(|err| KernelError::store(err.to_string()))
}

pub struct StoreFs<S: KvStore> {
    tree: FsTree,
    store: S,
}

impl<S: KvStore> StoreFs<S> {
    /// Load the tree held by `store`, initialising an empty store with a
    /// bare root directory.
    pub async fn open(store: S) -> KernelResult<Self> {
        let records = store.scan(NODE_PREFIX).await?;
        if records.is_empty() {
            let mut fs = Self {
                tree: FsTree::journaled(),
                store,
            };
            let root: Vec<Change> = fs
                .tree
                .get("/")
                .cloned()
                .map(Change::Put)
                .into_iter()
                .collect();
            fs.persist(&root).await?;
            return Ok(fs);
        }

        let mut state = FsState::default();
        for (_, value) in records {
            let node = decode::<StoredNode>(&value)?.into_node()?;
            state.nodes.insert(node.path.clone(), node);
        }
        if let Some(meta) = store.get(META_KEY).await? {
            let meta: StoredMeta = decode(&meta)?;
            state.clock = meta.clock;
            for mount in meta.mounts {
                let shadowed = mount
                    .shadowed
                    .into_iter()
                    .map(StoredNode::into_node)
                    .collect::<KernelResult<Vec<_>>>()?;
                state.mounts.push(MountRecord {
                    path: mount.path,
                    introduced: mount.introduced,
                    shadowed,
                });
            }
        }

        let mut tree = FsTree::journaled();
        tree.import(state)?;
        tree.take_journal();
        tree.settle();
        debug!("store filesystem loaded {} nodes", tree.len());
        Ok(Self { tree, store })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    async fn mutate<T>(
        &mut self,
        op: impl FnOnce(&mut FsTree) -> KernelResult<T>,
    ) -> KernelResult<T> {
        let checkpoint = self.tree.checkpoint();
        let value = match op(&mut self.tree) {
            Ok(value) => value,
            Err(err) => {
                self.tree.rewind(checkpoint);
                return Err(err);
            }
        };

        let meta_changed = self.tree.meta_changed(&checkpoint);
        let changes: Vec<Change> = self
            .tree
            .take_journal()
            .into_iter()
            .filter(|change| !is_proc_entry(change.path()))
            .collect();
        if changes.is_empty() && !meta_changed {
            self.tree.settle();
            return Ok(value);
        }

        if let Err(err) = self.persist(&changes).await {
            warn!("store transaction failed, reverting: {err}");
            if let Err(rollback) = self.store.rollback().await {
                warn!("store rollback failed: {rollback}");
            }
            self.tree.rewind(checkpoint);
            return Err(err);
        }
        self.tree.settle();
        Ok(value)
    }

    async fn persist(&mut self, changes: &[Change]) -> KernelResult<()> {
        let mut mounts = Vec::with_capacity(self.tree.mounts().len());
        for mount in self.tree.mounts() {
            mounts.push(StoredMount {
                path: mount.path.clone(),
                introduced: mount.introduced.clone(),
                shadowed: mount
                    .shadowed
                    .iter()
                    .map(StoredNode::from_node)
                    .collect::<KernelResult<Vec<_>>>()?,
            });
        }
        let meta = encode(&StoredMeta {
            clock: self.tree.clock(),
            mounts,
        })?;

        self.store.begin().await?;
        for change in changes {
            match change {
                Change::Put(node) => {
                    let record = encode(&StoredNode::from_node(node)?)?;
                    self.store.put(&node_key(&node.path), record).await?;
                }
                Change::Remove(path) => self.store.delete(&node_key(path)).await?,
            }
        }
        self.store.put(META_KEY, meta).await?;
        self.store.commit().await
    }
}

#[async_trait(?Send)]
impl<S: KvStore> FileSystem for StoreFs<S> {
    fn backend(&self) -> &'static str {
        "store"
    }

    async fn open(
        &mut self,
        path: &str,
        flags: OpenFlags,
        cred: Credentials,
    ) -> KernelResult<NodeInfo> {
        self.mutate(|tree| tree.open(path, flags, cred)).await
    }

    async fn read(&self, path: &str) -> KernelResult<FileContent> {
        self.tree.read(path)
    }

    async fn write(&mut self, path: &str, data: &[u8], cred: Credentials) -> KernelResult<usize> {
        self.mutate(|tree| tree.write(path, data, cred)).await
    }

    async fn write_at(&mut self, path: &str, offset: usize, data: &[u8]) -> KernelResult<usize> {
        self.mutate(|tree| tree.write_at(path, offset, data)).await
    }

    async fn append(&mut self, path: &str, data: &[u8]) -> KernelResult<usize> {
        self.mutate(|tree| tree.append(path, data)).await
    }

    async fn create_file(
        &mut self,
        path: &str,
        data: &[u8],
        mode: Mode,
        cred: Credentials,
    ) -> KernelResult<NodeInfo> {
        self.mutate(|tree| tree.create_file(path, data, mode, cred))
            .await
    }

    async fn mkdir(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<NodeInfo> {
        self.mutate(|tree| tree.mkdir(path, mode, cred)).await
    }

    async fn readdir(&self, path: &str, cred: Credentials) -> KernelResult<Vec<NodeInfo>> {
        self.tree.readdir(path, cred)
    }

    async fn unlink(&mut self, path: &str, cred: Credentials) -> KernelResult<()> {
        self.mutate(|tree| tree.unlink(path, cred)).await
    }

    async fn rename(&mut self, old: &str, new: &str, cred: Credentials) -> KernelResult<()> {
        self.mutate(|tree| tree.rename(old, new, cred)).await
    }

    async fn chmod(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<()> {
        self.mutate(|tree| tree.chmod(path, mode, cred)).await
    }

    async fn mount(&mut self, image: &FsImage, path: &str) -> KernelResult<usize> {
        self.mutate(|tree| tree.mount(image, path)).await
    }

    async fn unmount(&mut self, path: &str) -> KernelResult<()> {
        self.mutate(|tree| tree.unmount(path)).await
    }

    async fn stat(&self, path: &str) -> KernelResult<NodeInfo> {
        self.tree.stat(path)
    }

    async fn exists(&self, path: &str) -> bool {
        self.tree.exists(path)
    }

    async fn insert_virtual(&mut self, path: &str, source: VirtualSource) -> KernelResult<()> {
        self.mutate(|tree| tree.insert_virtual(path, source)).await
    }

    async fn remove_tree(&mut self, path: &str) -> KernelResult<()> {
        self.mutate(|tree| tree.remove_tree(path)).await
    }

    async fn image(&self) -> FsImage {
        self.tree.image()
    }

    async fn export(&self) -> FsState {
        self.tree.export()
    }

    async fn import(&mut self, state: FsState) -> KernelResult<()> {
        self.mutate(|tree| tree.import(state)).await
    }
}
