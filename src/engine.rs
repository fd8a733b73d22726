//! The integrity engine: orchestrates the path mapper, sidecar
//! store, WORM policy, and handle table on every read, write, open,
//! release, truncate, unlink, and rename.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use crate::block;
use crate::digest::{self, Fnv1a};
use crate::error::{OverlayError, OverlayResult};
use crate::handles::{HandleTable, Role, Verification};
use crate::path_map::PathMapper;
use crate::sidecar::Sidecar;
use crate::worm::WormPolicy;

/// Checksum granularity, selected at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    WholeFile,
    Block,
}

/// Verification strategy for a non-truncating writer open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenVerifyMode {
    /// Verify and pre-load the digest when opening for append/random-write.
    Strict,
    /// Skip verification at open; recompute the digest from backing
    /// content at release instead of trusting the accumulator.
    Relaxed,
}

pub struct Engine {
    mapper: PathMapper,
    sidecar: Sidecar,
    worm: WormPolicy,
    handles: HandleTable,
    mode: ChecksumMode,
    open_verify: OpenVerifyMode,
}

impl Engine {
    pub fn new(
        mapper: PathMapper,
        sidecar: Sidecar,
        worm: WormPolicy,
        mode: ChecksumMode,
        open_verify: OpenVerifyMode,
    ) -> Self {
        Self { mapper, sidecar, worm, handles: HandleTable::new(), mode, open_verify }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn is_worm(&self, path: &str) -> bool {
        self.worm.is_append_only(path)
    }

    fn abs(&self, path: &str) -> std::path::PathBuf {
        self.mapper.map(path)
    }

    /// Read a stored whole-file digest, failing open (treating a
    /// sidecar error as "no digest on record").
    fn digest_fail_open(&self, path: &str) -> Option<String> {
        match self.sidecar.get_digest(path) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%path, error = %e, "sidecar read failed, treating as unprotected");
                None
            }
        }
    }

    fn block_digest_fail_open(&self, path: &str, index: u64) -> Option<String> {
        match self.sidecar.get_block(path, index) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%path, index, error = %e, "sidecar block read failed, treating as unprotected");
                None
            }
        }
    }

    // ---- open / create -------------------------------------------------

    /// Open an existing path. `write` and `truncate` mirror the flags the
    /// dispatch layer decoded from the host open call.
    pub fn open(&self, path: &str, write: bool, truncate: bool) -> OverlayResult<u64> {
        if self.worm.is_append_only(path) && truncate {
            return Err(OverlayError::Policy);
        }
        if write && self.handles.has_writer(path) {
            return Err(OverlayError::Busy);
        }

        let abs = self.abs(path);
        let file = OpenOptions::new().read(true).write(write).truncate(truncate && write).open(&abs)?;

        if !write {
            let fh = self.handles.insert(path.to_string(), file, Role::Reader { verification: Verification::Unverified });
            return Ok(fh);
        }

        match self.mode {
            ChecksumMode::Block => {
                if truncate {
                    self.sidecar.del_all_blocks(path)?;
                }
                let fh = self.handles.insert(path.to_string(), file, Role::Block { is_writer: true });
                Ok(fh)
            }
            ChecksumMode::WholeFile => {
                if truncate {
                    let fh = self.handles.insert(path.to_string(), file, Role::WriterFresh { acc: Fnv1a::new() });
                    Ok(fh)
                } else {
                    match self.open_verify {
                        OpenVerifyMode::Relaxed => {
                            let fh =
                                self.handles.insert(path.to_string(), file, Role::WriterAppend { acc: Fnv1a::new() });
                            Ok(fh)
                        }
                        OpenVerifyMode::Strict => {
                            let current = digest::digest_file(&abs)?;
                            if let Some(stored) = self.digest_fail_open(path) {
                                if stored != current {
                                    return Err(OverlayError::Integrity);
                                }
                            }
                            let acc = Fnv1a::from_hex(&current).unwrap_or_else(Fnv1a::new);
                            let fh = self.handles.insert(path.to_string(), file, Role::WriterAppend { acc });
                            Ok(fh)
                        }
                    }
                }
            }
        }
    }

    /// Create (and open for writing) a new path, entering `W-fresh`.
    /// Rejected under WORM if an object already exists at `path`: the
    /// host's `O_CREAT|O_TRUNC` would otherwise erase append-only history.
    pub fn create(&self, path: &str) -> OverlayResult<u64> {
        if self.worm.is_append_only(path) && self.abs(path).exists() {
            return Err(OverlayError::Policy);
        }
        if self.handles.has_writer(path) {
            return Err(OverlayError::Busy);
        }
        let abs = self.abs(path);
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&abs)?;
        self.sidecar.del_all_blocks(path)?;
        let fh = match self.mode {
            ChecksumMode::WholeFile => {
                self.handles.insert(path.to_string(), file, Role::WriterFresh { acc: Fnv1a::new() })
            }
            ChecksumMode::Block => self.handles.insert(path.to_string(), file, Role::Block { is_writer: true }),
        };
        Ok(fh)
    }

    // ---- read / write ----------------------------------------------------

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> OverlayResult<Vec<u8>> {
        let path = self.handles.with_mut(fh, |r| r.path.clone()).ok_or(OverlayError::Stale)?;

        match self.mode {
            ChecksumMode::Block => self.block_read(fh, &path, offset, size),
            ChecksumMode::WholeFile => self.whole_file_read(fh, &path, offset, size),
        }
    }

    fn whole_file_read(&self, fh: u64, path: &str, offset: u64, size: u32) -> OverlayResult<Vec<u8>> {
        let abs = self.abs(path);
        let needs_verify = self
            .handles
            .with_mut(fh, |r| match &r.role {
                Role::Reader { verification } => Some(*verification),
                _ => None,
            })
            .flatten();

        if let Some(verification) = needs_verify {
            match verification {
                Verification::Bad => return Err(OverlayError::Integrity),
                Verification::Ok => {}
                Verification::Unverified => {
                    let current = digest::digest_file(&abs)?;
                    let stored = self.digest_fail_open(path);
                    let ok = stored.map(|s| s == current).unwrap_or(true);
                    let next = if ok { Verification::Ok } else { Verification::Bad };
                    self.handles.with_mut(fh, |r| {
                        if let Role::Reader { verification } = &mut r.role {
                            *verification = next;
                        }
                    });
                    if !ok {
                        return Err(OverlayError::Integrity);
                    }
                }
            }
        }

        self.handles
            .with_mut(fh, |r| read_range(&mut r.file, offset, size))
            .ok_or(OverlayError::Stale)?
            .map_err(OverlayError::from)
    }

    fn block_read(&self, fh: u64, path: &str, offset: u64, size: u32) -> OverlayResult<Vec<u8>> {
        let result = self.handles.with_mut(fh, |r| -> OverlayResult<Vec<u8>> {
            let file_len = r.file.metadata()?.len();
            let read_len = if offset >= file_len { 0 } else { (size as u64).min(file_len - offset) };
            let mut out = Vec::with_capacity(read_len as usize);
            for (idx, local_start, local_end) in block::touched_blocks(offset, read_len) {
                let bytes = block::read_block_bytes(&mut r.file, idx)?;
                let digest = block::digest_block_bytes(&bytes);
                if let Some(stored) = self.block_digest_fail_open(path, idx) {
                    if stored != digest {
                        return Err(OverlayError::Integrity);
                    }
                }
                let end = (local_end as usize).min(bytes.len());
                let start = (local_start as usize).min(end);
                out.extend_from_slice(&bytes[start..end]);
            }
            Ok(out)
        });
        result.ok_or(OverlayError::Stale)?
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> OverlayResult<u32> {
        match self.mode {
            ChecksumMode::Block => {
                let path = self.handles.with_mut(fh, |r| r.path.clone()).ok_or(OverlayError::Stale)?;
                self.block_write(fh, &path, offset, data)
            }
            ChecksumMode::WholeFile => self
                .handles
                .with_mut(fh, |r| match &mut r.role {
                    Role::WriterFresh { acc } | Role::WriterAppend { acc } => {
                        acc.update(data);
                        write_range(&mut r.file, offset, data).map_err(OverlayError::from)
                    }
                    _ => Err(OverlayError::NotSupported),
                })
                .ok_or(OverlayError::Stale)?,
        }
    }

    fn block_write(&self, fh: u64, path: &str, offset: u64, data: &[u8]) -> OverlayResult<u32> {
        let result = self.handles.with_mut(fh, |r| -> OverlayResult<u32> {
            for (idx, local_start, local_end) in block::touched_blocks(offset, data.len() as u64) {
                let block_start_global = idx * digest::BLOCK_SIZE;
                let mut buf = block::read_block_bytes(&mut r.file, idx)?;
                let pre_digest = block::digest_block_bytes(&buf);
                if let Some(stored) = self.block_digest_fail_open(path, idx) {
                    if stored != pre_digest {
                        return Err(OverlayError::Integrity);
                    }
                }
                let needed_len = local_end as usize;
                if buf.len() < needed_len {
                    buf.resize(needed_len, 0);
                }
                let src_offset = (block_start_global + local_start - offset) as usize;
                let write_len = (local_end - local_start) as usize;
                buf[local_start as usize..local_end as usize]
                    .copy_from_slice(&data[src_offset..src_offset + write_len]);
                r.file.seek(SeekFrom::Start(block_start_global))?;
                r.file.write_all(&buf)?;
                let new_digest = block::digest_block_bytes(&buf);
                self.sidecar.put_block(path, idx, &new_digest)?;
            }
            r.file.flush()?;
            Ok(data.len() as u32)
        });
        result.ok_or(OverlayError::Stale)?
    }

    pub fn release(&self, fh: u64) -> OverlayResult<()> {
        let record = self.handles.remove(fh).ok_or(OverlayError::Stale)?;
        match record.role {
            Role::WriterFresh { acc } => {
                self.sidecar.put_digest(&record.path, &acc.to_hex())?;
            }
            Role::WriterAppend { acc } => {
                let digest = match self.open_verify {
                    OpenVerifyMode::Strict => acc.to_hex(),
                    OpenVerifyMode::Relaxed => {
                        let abs = self.abs(&record.path);
                        digest::digest_file(&abs)?
                    }
                };
                self.sidecar.put_digest(&record.path, &digest)?;
            }
            Role::Block { .. } | Role::Reader { .. } => {}
        }
        Ok(())
    }

    // ---- cross-handle operations ------------------------------------------

    pub fn truncate(&self, path: &str, new_size: u64) -> OverlayResult<()> {
        if self.worm.is_append_only(path) {
            return Err(OverlayError::Policy);
        }
        let abs = self.abs(path);
        let old_size = std::fs::metadata(&abs)?.len();
        {
            let file = OpenOptions::new().write(true).open(&abs)?;
            file.set_len(new_size)?;
        }

        match self.mode {
            ChecksumMode::WholeFile => {
                let new_digest = digest::digest_file(&abs)?;
                self.sidecar.put_digest(path, &new_digest)?;
                if let Some(acc) = Fnv1a::from_hex(&new_digest) {
                    self.handles.reset_writer_accumulators(path, acc);
                }
            }
            ChecksumMode::Block => {
                if new_size == 0 {
                    self.sidecar.del_all_blocks(path)?;
                } else {
                    let last = (new_size - 1) / digest::BLOCK_SIZE;
                    self.sidecar.del_blocks_after(path, last)?;
                    let mut file = OpenOptions::new().read(true).open(&abs)?;
                    // Growing rewrites the old last block's bytes (zero-padding)
                    // and introduces new zero-filled blocks, so every block from
                    // the old EOF through the new last block needs a fresh digest,
                    // not just `last`. Shrinking only ever touches `last`.
                    let rehash_start = if new_size > old_size {
                        if old_size == 0 { 0 } else { (old_size - 1) / digest::BLOCK_SIZE }
                    } else {
                        last
                    };
                    for idx in rehash_start..=last {
                        let bytes = block::read_block_bytes(&mut file, idx)?;
                        let digest = block::digest_block_bytes(&bytes);
                        self.sidecar.put_block(path, idx, &digest)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> OverlayResult<()> {
        if self.worm.is_append_only(path) {
            return Err(OverlayError::Policy);
        }
        let abs = self.abs(path);
        std::fs::remove_file(&abs)?;
        self.sidecar.del_xattrs(path)?;
        self.sidecar.del_digest(path)?;
        self.sidecar.del_all_blocks(path)?;
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> OverlayResult<()> {
        if self.worm.is_append_only(from) || self.worm.is_append_only(to) {
            return Err(OverlayError::Policy);
        }
        let abs_from = self.abs(from);
        let abs_to = self.abs(to);
        std::fs::rename(&abs_from, &abs_to)?;
        self.sidecar.rename_path(from, to)?;
        Ok(())
    }

    // ---- extended attributes --------------------------------------------

    pub fn get_xattr(&self, path: &str, key: &str) -> OverlayResult<Vec<u8>> {
        self.sidecar.get_xattr(path, key)?.ok_or(OverlayError::NoXattr)
    }

    pub fn set_xattr(&self, path: &str, key: &str, value: &[u8]) -> OverlayResult<()> {
        self.sidecar.put_xattr(path, key, value)?;
        Ok(())
    }

    pub fn list_xattr(&self, path: &str) -> OverlayResult<Vec<String>> {
        Ok(self.sidecar.list_xattr(path)?)
    }

    /// The stored whole-file digest for `path`, or `None` if unset.
    pub fn get_digest(&self, path: &str) -> OverlayResult<Option<String>> {
        Ok(self.sidecar.get_digest(path)?)
    }

    pub fn remove_xattr(&self, path: &str, key: &str) -> OverlayResult<()> {
        if self.sidecar.get_xattr(path, key)?.is_none() {
            return Err(OverlayError::NoXattr);
        }
        self.sidecar.del_xattr_key(path, key)?;
        Ok(())
    }

    /// Remove every sidecar record rooted at `path`, used when the
    /// backing store removes a directory subtree out from under us
    /// (e.g. `rmdir`, which the engine otherwise never sees).
    pub fn forget_subtree(&self, path: &str) -> OverlayResult<()> {
        self.sidecar.del_xattrs(path)?;
        self.sidecar.del_digest(path)?;
        self.sidecar.del_all_blocks(path)?;
        Ok(())
    }
}

fn read_range(file: &mut std::fs::File, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let len = file.metadata()?.len();
    let to_read = if offset >= len { 0 } else { (size as u64).min(len - offset) as usize };
    let mut buf = vec![0u8; to_read];
    if to_read > 0 {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
    }
    Ok(buf)
}

fn write_range(file: &mut std::fs::File, offset: u64, data: &[u8]) -> std::io::Result<u32> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.flush()?;
    Ok(data.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn engine(root: &std::path::Path, worm: &[&str], mode: ChecksumMode) -> Engine {
        Engine::new(
            PathMapper::new(root.to_path_buf()),
            Sidecar::open_in_memory().unwrap(),
            WormPolicy::new(worm.iter().map(|s| s.to_string())),
            mode,
            OpenVerifyMode::Strict,
        )
    }

    #[test]
    fn write_then_read_back_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::WholeFile);
        let fh = eng.create("/a.txt").unwrap();
        eng.write(fh, 0, b"hello world\n").unwrap();
        eng.release(fh).unwrap();

        let fh = eng.open("/a.txt", false, false).unwrap();
        let data = eng.read(fh, 0, 64).unwrap();
        assert_eq!(data, b"hello world\n");
        eng.release(fh).unwrap();
    }

    #[test]
    fn corruption_is_detected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::WholeFile);
        let fh = eng.create("/a.txt").unwrap();
        eng.write(fh, 0, b"hello world\n").unwrap();
        eng.release(fh).unwrap();

        fs::write(dir.path().join("a.txt"), b"tampered!!!!\n").unwrap();

        let fh = eng.open("/a.txt", false, false).unwrap();
        let err = eng.read(fh, 0, 64).unwrap_err();
        assert!(matches!(err, OverlayError::Integrity));
    }

    #[test]
    fn worm_rejects_truncating_open_and_truncate_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &["/logs"], ChecksumMode::WholeFile);
        fs::create_dir(dir.path().join("logs")).unwrap();
        let fh = eng.create("/logs/a.txt").unwrap();
        eng.write(fh, 0, b"entry one\n").unwrap();
        eng.release(fh).unwrap();

        assert!(matches!(eng.open("/logs/a.txt", true, true), Err(OverlayError::Policy)));
        assert!(matches!(eng.truncate("/logs/a.txt", 0), Err(OverlayError::Policy)));
        assert!(matches!(eng.unlink("/logs/a.txt"), Err(OverlayError::Policy)));

        let fh = eng.open("/logs/a.txt", true, false).unwrap();
        eng.write(fh, 10, b"entry two\n").unwrap();
        eng.release(fh).unwrap();
        let fh = eng.open("/logs/a.txt", false, false).unwrap();
        let data = eng.read(fh, 0, 128).unwrap();
        assert_eq!(data, b"entry one\nentry two\n");
    }

    #[test]
    fn unlink_clears_sidecar_records() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::WholeFile);
        let fh = eng.create("/a.txt").unwrap();
        eng.write(fh, 0, b"data").unwrap();
        eng.release(fh).unwrap();
        eng.set_xattr("/a.txt", "user.tag", b"v").unwrap();

        eng.unlink("/a.txt").unwrap();
        assert!(eng.digest_fail_open("/a.txt").is_none());
        assert!(matches!(eng.get_xattr("/a.txt", "user.tag"), Err(OverlayError::NoXattr)));
    }

    #[test]
    fn rename_relabels_digest_and_xattrs() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::WholeFile);
        let fh = eng.create("/a.txt").unwrap();
        eng.write(fh, 0, b"data").unwrap();
        eng.release(fh).unwrap();
        eng.set_xattr("/a.txt", "user.tag", b"v").unwrap();

        eng.rename("/a.txt", "/b.txt").unwrap();
        assert!(dir.path().join("b.txt").exists());
        assert_eq!(eng.get_xattr("/b.txt", "user.tag").unwrap(), b"v");
        let fh = eng.open("/b.txt", false, false).unwrap();
        let data = eng.read(fh, 0, 64).unwrap();
        assert_eq!(data, b"data");
    }

    #[test]
    fn block_mode_detects_tampered_block() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::Block);
        let fh = eng.create("/b.bin").unwrap();
        let payload = vec![7u8; 4096 * 2];
        eng.write(fh, 0, &payload).unwrap();
        eng.release(fh).unwrap();

        let mut backing = fs::OpenOptions::new().write(true).open(dir.path().join("b.bin")).unwrap();
        use std::io::Write as _;
        backing.seek(SeekFrom::Start(4096)).unwrap();
        backing.write_all(&[9u8; 8]).unwrap();

        let fh = eng.open("/b.bin", false, false).unwrap();
        let err = eng.read(fh, 0, 4096 * 2).unwrap_err();
        assert!(matches!(err, OverlayError::Integrity));
    }

    #[test]
    fn block_mode_truncate_grow_across_block_boundary_rehashes_old_tail() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::Block);
        let fh = eng.create("/g.bin").unwrap();
        eng.write(fh, 0, b"abcdef").unwrap();
        eng.release(fh).unwrap();

        eng.truncate("/g.bin", 5000).unwrap();

        let fh = eng.open("/g.bin", false, false).unwrap();
        let data = eng.read(fh, 0, 5000).unwrap();
        assert_eq!(data.len(), 5000);
        assert_eq!(&data[..6], b"abcdef");
        assert!(data[6..].iter().all(|&b| b == 0));
        eng.release(fh).unwrap();

        // A second write into the zero-padded tail of the old last block
        // must not be rejected as corruption: its stored digest has to
        // already reflect the zero-extended content, not the pre-grow bytes.
        let fh = eng.open("/g.bin", true, false).unwrap();
        eng.write(fh, 6, b"XYZ").unwrap();
        eng.release(fh).unwrap();
        let fh = eng.open("/g.bin", false, false).unwrap();
        let data = eng.read(fh, 0, 16).unwrap();
        assert_eq!(&data[..9], b"abcdefXYZ");
        eng.release(fh).unwrap();
    }

    #[test]
    fn block_mode_truncate_shrink_mid_block_rehashes_trimmed_tail() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::Block);
        let fh = eng.create("/s.bin").unwrap();
        let payload = vec![5u8; 4096 + 100];
        eng.write(fh, 0, &payload).unwrap();
        eng.release(fh).unwrap();

        eng.truncate("/s.bin", 2000).unwrap();

        let fh = eng.open("/s.bin", false, false).unwrap();
        let data = eng.read(fh, 0, 4096).unwrap();
        assert_eq!(data.len(), 2000);
        assert!(data.iter().all(|&b| b == 5));
        eng.release(fh).unwrap();

        // Writing past the trimmed tail must verify cleanly against the
        // digest stored for the now-shorter block 0, not a stale one.
        let fh = eng.open("/s.bin", true, false).unwrap();
        eng.write(fh, 2000, b"tail").unwrap();
        eng.release(fh).unwrap();
        let fh = eng.open("/s.bin", false, false).unwrap();
        let data = eng.read(fh, 1996, 8).unwrap();
        assert_eq!(&data, b"5555tail");
        eng.release(fh).unwrap();
    }

    #[test]
    fn concurrent_writer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path(), &[], ChecksumMode::WholeFile);
        let fh1 = eng.create("/a.txt").unwrap();
        let err = eng.open("/a.txt", true, false).unwrap_err();
        assert!(matches!(err, OverlayError::Busy));
        eng.release(fh1).unwrap();
    }
}
