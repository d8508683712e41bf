use async_trait::async_trait;

use crate::error::KernelResult;

use super::{
    Credentials, FileContent, FileSystem, FsImage, FsState, FsTree, Mode, NodeInfo, OpenFlags,
    VirtualSource,
};

/// In-memory backend. Every operation completes synchronously inside the
/// async contract.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    tree: FsTree,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &FsTree {
        &self.tree
    }
}

#[async_trait(?Send)]
impl FileSystem for MemoryFs {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn open(
        &mut self,
        path: &str,
        flags: OpenFlags,
        cred: Credentials,
    ) -> KernelResult<NodeInfo> {
        self.tree.open(path, flags, cred)
    }

    async fn read(&self, path: &str) -> KernelResult<FileContent> {
        self.tree.read(path)
    }

    async fn write(&mut self, path: &str, data: &[u8], cred: Credentials) -> KernelResult<usize> {
        self.tree.write(path, data, cred)
    }

    async fn write_at(&mut self, path: &str, offset: usize, data: &[u8]) -> KernelResult<usize> {
        self.tree.write_at(path, offset, data)
    }

    async fn append(&mut self, path: &str, data: &[u8]) -> KernelResult<usize> {
        self.tree.append(path, data)
    }

    async fn create_file(
        &mut self,
        path: &str,
        data: &[u8],
        mode: Mode,
        cred: Credentials,
    ) -> KernelResult<NodeInfo> {
        self.tree.create_file(path, data, mode, cred)
    }

    async fn mkdir(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<NodeInfo> {
        self.tree.mkdir(path, mode, cred)
    }

    async fn readdir(&self, path: &str, cred: Credentials) -> KernelResult<Vec<NodeInfo>> {
        self.tree.readdir(path, cred)
    }

    async fn unlink(&mut self, path: &str, cred: Credentials) -> KernelResult<()> {
        self.tree.unlink(path, cred)
    }

    async fn rename(&mut self, old: &str, new: &str, cred: Credentials) -> KernelResult<()> {
        self.tree.rename(old, new, cred)
    }

    async fn chmod(&mut self, path: &str, mode: Mode, cred: Credentials) -> KernelResult<()> {
        self.tree.chmod(path, mode, cred)
    }

    async fn mount(&mut self, image: &FsImage, path: &str) -> KernelResult<usize> {
        self.tree.mount(image, path)
    }

    async fn unmount(&mut self, path: &str) -> KernelResult<()> {
        self.tree.unmount(path)
    }

    async fn stat(&self, path: &str) -> KernelResult<NodeInfo> {
        self.tree.stat(path)
    }

    async fn exists(&self, path: &str) -> bool {
        self.tree.exists(path)
    }

    async fn insert_virtual(&mut self, path: &str, source: VirtualSource) -> KernelResult<()> {
        self.tree.insert_virtual(path, source)
    }

    async fn remove_tree(&mut self, path: &str) -> KernelResult<()> {
        self.tree.remove_tree(path)
    }

    async fn image(&self) -> FsImage {
        self.tree.image()
    }

    async fn export(&self) -> FsState {
        self.tree.export()
    }

    async fn import(&mut self, state: FsState) -> KernelResult<()> {
        self.tree.import(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_async_contract() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/tmp", Mode::new(0o755), Credentials::ROOT)
            .await
            .expect("mkdir");
        fs.create_file("/tmp/a.txt", b"hi", Mode::new(0o644), Credentials::ROOT)
            .await
            .expect("create");

        let info = fs
            .open("/tmp/a.txt", OpenFlags::read_only(), Credentials::ROOT)
            .await
            .expect("open");
        assert_eq!(info.size, 2);
        assert_eq!(
            fs.read("/tmp/a.txt").await.expect("read"),
            FileContent::Stored(b"hi".to_vec())
        );
        assert_eq!(fs.backend(), "memory");
    }

    #[tokio::test]
    async fn readdir_on_file_is_enotdir() {
        let mut fs = MemoryFs::new();
        fs.write("/f", b"x", Credentials::ROOT).await.expect("write");
        let err = fs.readdir("/f", Credentials::ROOT).await.unwrap_err();
        assert_eq!(err.errno_name(), "ENOTDIR");
    }
}
