//! `fuser::Filesystem` binding: the only module that deals in inode
//! numbers and FUSE reply types. Translates kernel upcalls into virtual
//! paths and `Engine` calls, and engine errors back into errno replies.

use std::ffi::OsStr;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::ENOENT;

use crate::engine::Engine;
use crate::inodes::InodeTable;
use crate::path_map::join_virtual;

const TTL: Duration = Duration::from_secs(1);

/// Owns the inode table and the integrity engine; this is what
/// `fuser::mount2` actually drives.
pub struct Mount {
    engine: Engine,
    inodes: Mutex<InodeTable>,
}

impl Mount {
    pub fn new(engine: Engine) -> Self {
        Self { engine, inodes: Mutex::new(InodeTable::new()) }
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.inodes.lock().unwrap().path(ino)
    }

    fn ino_for(&self, path: &str) -> u64 {
        self.inodes.lock().unwrap().ensure_ino(path)
    }

    fn attr_for(&self, ino: u64, path: &str) -> std::io::Result<FileAttr> {
        let abs = self.engine.mapper().map(path);
        let meta = std::fs::symlink_metadata(&abs)?;
        Ok(attr_from_metadata(ino, &meta))
    }
}

fn attr_from_metadata(ino: u64, meta: &std::fs::Metadata) -> FileAttr {
    let kind = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: meta.len(),
        blocks: (meta.len() + 511) / 512,
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        crtime: SystemTime::UNIX_EPOCH,
        kind,
        perm: (meta.permissions().mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn os_to_str(name: &OsStr) -> Option<&str> {
    name.to_str()
}

impl Filesystem for Mount {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = os_to_str(name) else {
            reply.error(ENOENT);
            return;
        };
        let child_path = join_virtual(&parent_path, name);
        let abs = self.engine.mapper().map(&child_path);
        match std::fs::symlink_metadata(&abs) {
            Ok(meta) => {
                let ino = self.ino_for(&child_path);
                reply.entry(&TTL, &attr_from_metadata(ino, &meta), 0);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(ENOENT)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_for(ino, &path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(ENOENT)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        if let Some(new_size) = size {
            if let Err(e) = self.engine.truncate(&path, new_size) {
                reply.error(e.to_errno());
                return;
            }
        }
        match self.attr_for(ino, &path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(ENOENT)),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = os_to_str(name) else {
            reply.error(ENOENT);
            return;
        };
        let child_path = join_virtual(&parent_path, name);
        let abs = self.engine.mapper().map(&child_path);
        if let Err(e) = std::fs::create_dir(&abs) {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let _ = std::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode & 0o7777));
        let ino = self.ino_for(&child_path);
        match self.attr_for(ino, &child_path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = os_to_str(name) else {
            reply.error(ENOENT);
            return;
        };
        let child_path = join_virtual(&parent_path, name);
        if self.engine.is_worm(&child_path) {
            reply.error(libc::EACCES);
            return;
        }
        let abs = self.engine.mapper().map(&child_path);
        if let Err(e) = std::fs::remove_dir(&abs) {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        if let Err(e) = self.engine.forget_subtree(&child_path) {
            reply.error(e.to_errno());
            return;
        }
        self.inodes.lock().unwrap().remove_subtree(&child_path);
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = os_to_str(name) else {
            reply.error(ENOENT);
            return;
        };
        let child_path = join_virtual(&parent_path, name);
        match self.engine.unlink(&child_path) {
            Ok(()) => {
                self.inodes.lock().unwrap().remove(&child_path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(newparent_path)) = (self.path_for(parent), self.path_for(newparent)) else {
            reply.error(ENOENT);
            return;
        };
        let (Some(name), Some(newname)) = (os_to_str(name), os_to_str(newname)) else {
            reply.error(ENOENT);
            return;
        };
        let from = join_virtual(&parent_path, name);
        let to = join_virtual(&newparent_path, newname);
        match self.engine.rename(&from, &to) {
            Ok(()) => {
                self.inodes.lock().unwrap().rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        let write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        let truncate = flags & libc::O_TRUNC != 0;
        match self.engine.open(&path, write, truncate) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = os_to_str(name) else {
            reply.error(ENOENT);
            return;
        };
        let child_path = join_virtual(&parent_path, name);
        match self.engine.create(&child_path) {
            Ok(fh) => {
                let _ = std::fs::set_permissions(
                    self.engine.mapper().map(&child_path),
                    std::fs::Permissions::from_mode(mode & 0o7777),
                );
                let ino = self.ino_for(&child_path);
                match self.attr_for(ino, &child_path) {
                    Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
                    Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.engine.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.engine.write(fh, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.engine.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        let abs = self.engine.mapper().map(&path);
        let entries = match std::fs::read_dir(&abs) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };

        let mut all = vec![(ino, FileType::Directory, ".".to_string()), (ino, FileType::Directory, "..".to_string())];
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            let child_path = join_virtual(&path, &name);
            let child_ino = self.ino_for(&child_path);
            let kind = if entry.path().is_dir() { FileType::Directory } else { FileType::RegularFile };
            all.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(path), Some(name)) = (self.path_for(ino), os_to_str(name)) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.set_xattr(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (Some(path), Some(name)) = (self.path_for(ino), os_to_str(name)) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.get_xattr(&path, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.list_xattr(&path) {
            Ok(keys) => {
                let mut buf = Vec::new();
                for key in keys {
                    buf.extend_from_slice(key.as_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if buf.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&buf);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(path), Some(name)) = (self.path_for(ino), os_to_str(name)) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.remove_xattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

