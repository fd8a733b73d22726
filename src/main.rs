use wormfs::config::Config;
use wormfs::engine::Engine;
use wormfs::filesystem::Mount;
use wormfs::path_map::PathMapper;
use wormfs::sidecar::Sidecar;
use wormfs::worm::WormPolicy;

const SIDECAR_FILE: &str = ".metadata.db";

fn mount_option(raw: &str) -> Option<fuser::MountOption> {
    match raw {
        "ro" => Some(fuser::MountOption::RO),
        "rw" => Some(fuser::MountOption::RW),
        "allow_root" => Some(fuser::MountOption::AllowRoot),
        "allow_other" => Some(fuser::MountOption::AllowOther),
        "auto_unmount" => Some(fuser::MountOption::AutoUnmount),
        "default_permissions" => Some(fuser::MountOption::DefaultPermissions),
        other => other.strip_prefix("fsname=").map(|name| fuser::MountOption::FSName(name.to_string())),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let sidecar_path = config.backing_dir.join(SIDECAR_FILE);
    let sidecar = match Sidecar::open(&sidecar_path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(path = ?sidecar_path, error = %e, "failed to open sidecar store");
            std::process::exit(1);
        }
    };

    let mapper = PathMapper::new(config.backing_dir.clone());
    let worm = WormPolicy::new(config.append_only_dirs.clone());
    let engine = Engine::new(mapper, sidecar, worm, config.checksum_mode, config.open_verify);
    let mount = Mount::new(engine);

    let mut options =
        vec![fuser::MountOption::FSName("wormfs".to_string())];
    for raw in &config.mount_options {
        match mount_option(raw) {
            Some(opt) => options.push(opt),
            None => tracing::warn!(option = %raw, "ignoring unrecognized mount option"),
        }
    }

    tracing::info!(backing = ?config.backing_dir, mount = ?config.mount_point, "mounting");
    if let Err(e) = fuser::mount2(mount, &config.mount_point, &options) {
        tracing::error!(error = %e, "mount failed");
        std::process::exit(1);
    }
}
