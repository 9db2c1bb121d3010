//! FUSE adapter and request handling
//!
//! Implements the rfuse3 `Filesystem` trait for [`VFS`], translating kernel
//! requests (inode based) into driver calls (name and handle based) and
//! driver errors into errno values.
//!
//! - `mount`: mount helpers over the rfuse3 raw session.
//!
//! The namespace is a single flat directory: every request whose parent is
//! not the root inode fails with ENOENT. Files are opened with direct I/O so
//! each read reaches the driver and sees the current committed size.
pub mod mount;

use crate::chuck::ChunkStore;
use crate::vfs::{FileAttr as VfsFileAttr, FileType as VfsFileType, OpenFlags, ROOT_INO, VFS, VfsError};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use tracing::debug;

use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};

/// Bypass the kernel page cache for file data.
const FOPEN_DIRECT_IO: u32 = 1;

const MAX_WRITE: u32 = 1024 * 1024;

/// errno reported to the kernel for each driver error.
pub fn errno_of(e: &VfsError) -> libc::c_int {
    match e {
        VfsError::NotFound { .. } => libc::ENOENT,
        VfsError::Busy { .. } => libc::EBUSY,
        VfsError::NotWriteOwner | VfsError::BadHandle(_) => libc::EBADF,
        VfsError::InvalidInput(_) => libc::EINVAL,
        VfsError::IoFailure(_) | VfsError::Corruption(_) => libc::EIO,
    }
}

impl From<VfsError> for Errno {
    fn from(e: VfsError) -> Self {
        debug!(error = %e, "request failed");
        errno_of(&e).into()
    }
}


impl<S> VFS<S>
where
    S: ChunkStore + 'static,
{
    fn child_name(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        if parent != ROOT_INO {
            return Err(libc::ENOENT.into());
        }
        name.to_str()
            .map(str::to_string)
            .ok_or_else(|| libc::EINVAL.into())
    }

    async fn name_of_ino(&self, ino: u64) -> FuseResult<String> {
        match self.name_of(ino).await {
            Some(name) => Ok(name),
            None if ino == ROOT_INO => Err(libc::EISDIR.into()),
            None => Err(libc::ENOENT.into()),
        }
    }

    async fn entry_reply(&self, req: &Request, name: &str) -> FuseResult<ReplyEntry> {
        let vattr = self.getattr(name).await?;
        Ok(ReplyEntry {
            ttl: self.config().attr_ttl,
            attr: vfs_to_fuse_attr(&vattr, req),
            generation: 0,
        })
    }

    async fn list_root(&self, req: &Request) -> FuseResult<Vec<DirectoryEntryPlus>> {
        let ttl = self.config().attr_ttl;
        let root = self.getattr_ino(ROOT_INO).await?;
        let mut all = Vec::new();
        for (i, name) in [".", ".."].into_iter().enumerate() {
            all.push(DirectoryEntryPlus {
                inode: ROOT_INO,
                generation: 0,
                kind: FuseFileType::Directory,
                name: OsString::from(name),
                offset: i as i64 + 1,
                attr: vfs_to_fuse_attr(&root, req),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }
        for (i, e) in self.readdir().await?.into_iter().enumerate() {
            // Raced with an unlink; leave it out.
            let Ok(cattr) = self.getattr_ino(e.ino).await else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                inode: e.ino,
                generation: 0,
                kind: vfs_kind_to_fuse(e.kind),
                name: OsString::from(e.name),
                offset: i as i64 + 3,
                attr: vfs_to_fuse_attr(&cattr, req),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }
        Ok(all)
    }
}

impl<S> Filesystem for VFS<S>
where
    S: ChunkStore + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).ok_or(libc::EINVAL)?;
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let name = self.child_name(parent, name)?;
        self.entry_reply(&req, &name).await
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let vattr = match fh {
            Some(fh) if ino != ROOT_INO => match self.getattr_handle(fh).await {
                Ok(attr) => attr,
                Err(_) => self.getattr_ino(ino).await?,
            },
            _ => self.getattr_ino(ino).await?,
        };
        Ok(ReplyAttr {
            ttl: self.config().attr_ttl,
            attr: vfs_to_fuse_attr(&vattr, &req),
        })
    }

    // Only size changes are honoured; mode, owner and times are fixed.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        if ino == ROOT_INO {
            return Err(libc::EPERM.into());
        }
        let mut vattr = self.getattr_ino(ino).await?;
        if let Some(size) = set_attr.size {
            let name = self.name_of_ino(ino).await?;
            self.truncate(&name, size, fh).await?;
            vattr = self.getattr_ino(ino).await?;
            vattr.size = size;
        }
        Ok(ReplyAttr {
            ttl: self.config().attr_ttl,
            attr: vfs_to_fuse_attr(&vattr, &req),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let name = self.name_of_ino(ino).await?;
        let fh = VFS::open(self, &name, OpenFlags::from_posix(flags)).await?;
        Ok(ReplyOpen {
            fh,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let name = self.child_name(parent, name)?;
        // Creating implies writing: the new file belongs to this handle.
        let open_flags = OpenFlags {
            write: true,
            ..OpenFlags::from_posix(flags)
        };
        let fh = VFS::open(self, &name, open_flags).await?;
        let vattr = self.getattr_handle(fh).await?;
        Ok(ReplyCreated {
            ttl: self.config().attr_ttl,
            attr: vfs_to_fuse_attr(&vattr, &req),
            generation: 0,
            fh,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = VFS::read(self, fh, offset, size as usize).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let n = VFS::write(self, fh, offset, data).await?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        VFS::flush(self, fh).await?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        VFS::flush(self, fh).await?;
        Ok(())
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        VFS::release(self, fh).await?;
        Ok(())
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let name = self.child_name(parent, name)?;
        VFS::unlink(self, &name).await?;
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let name = self.child_name(parent, name)?;
        let new_name = self.child_name(new_parent, new_name)?;
        VFS::rename(self, &name, &new_name).await?;
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        if ino != ROOT_INO {
            return Err(if self.name_of(ino).await.is_some() {
                libc::ENOTDIR.into()
            } else {
                libc::ENOENT.into()
            });
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    // offset is that of the last entry already returned; resume after it.
    async fn readdir<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        if ino != ROOT_INO {
            return Err(libc::ENOTDIR.into());
        }
        let all: Vec<DirectoryEntry> = self
            .list_root(&req)
            .await?
            .into_iter()
            .map(|e| DirectoryEntry {
                inode: e.inode,
                kind: e.kind,
                name: e.name,
                offset: e.offset,
            })
            .collect();
        let slice: Vec<DirectoryEntry> = all.into_iter().filter(|e| e.offset > offset).collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        if ino != ROOT_INO {
            return Err(libc::ENOTDIR.into());
        }
        let all = self.list_root(&req).await?;
        let slice: Vec<DirectoryEntryPlus> = all
            .into_iter()
            .filter(|e| e.offset > offset as i64)
            .collect();
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Capacity is the store's business; only the file count is known.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.file_count().await as u64,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn vfs_kind_to_fuse(k: VfsFileType) -> FuseFileType {
    match k {
        VfsFileType::Dir => FuseFileType::Directory,
        VfsFileType::File => FuseFileType::RegularFile,
    }
}

fn vfs_to_fuse_attr(v: &VfsFileAttr, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let mtime = Timestamp::from(v.mtime);
    rfuse3::raw::reply::FileAttr {
        ino: v.ino,
        size: v.size,
        blocks: v.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: vfs_kind_to_fuse(v.kind),
        perm: v.mode as u16,
        nlink: match v.kind {
            VfsFileType::Dir => 2,
            VfsFileType::File => 1,
        },
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
