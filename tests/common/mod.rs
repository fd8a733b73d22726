use std::path::PathBuf;

use tempfile::TempDir;
use wormfs::engine::{ChecksumMode, Engine, OpenVerifyMode};
use wormfs::path_map::PathMapper;
use wormfs::sidecar::Sidecar;
use wormfs::worm::WormPolicy;

/// A backing directory plus the engine mounted over it, torn down
/// together when dropped.
pub struct Fixture {
    pub tempdir: TempDir,
    pub engine: Engine,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(&[], ChecksumMode::WholeFile, OpenVerifyMode::Strict)
    }

    pub fn with_worm(prefixes: &[&str]) -> Self {
        Self::build(prefixes, ChecksumMode::WholeFile, OpenVerifyMode::Strict)
    }

    pub fn with_mode(mode: ChecksumMode) -> Self {
        Self::build(&[], mode, OpenVerifyMode::Strict)
    }

    fn build(prefixes: &[&str], mode: ChecksumMode, open_verify: OpenVerifyMode) -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        let mapper = PathMapper::new(tempdir.path().to_path_buf());
        let sidecar = Sidecar::open(&tempdir.path().join(".metadata.db")).expect("open sidecar");
        let worm = WormPolicy::new(prefixes.iter().map(|s| s.to_string()));
        let engine = Engine::new(mapper, sidecar, worm, mode, open_verify);
        Self { tempdir, engine }
    }

    pub fn backing_path(&self, virtual_path: &str) -> PathBuf {
        self.tempdir.path().join(virtual_path.trim_start_matches('/'))
    }

    pub fn write_whole(&self, path: &str, data: &[u8]) {
        let fh = self.engine.create(path).expect("create");
        self.engine.write(fh, 0, data).expect("write");
        self.engine.release(fh).expect("release");
    }

    pub fn read_whole(&self, path: &str) -> Vec<u8> {
        let fh = self.engine.open(path, false, false).expect("open for read");
        let data = self.engine.read(fh, 0, 1 << 20).expect("read");
        self.engine.release(fh).expect("release");
        data
    }
}
