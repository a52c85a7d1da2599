//! Discovery of the external lister/transfer binary.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const LISTER_BIN: &str = "rclone";

/// Relative path of the bundle staged by the packaging scripts, both from
/// the project root (dev builds) and from the working directory.
const BUNDLE_SUBPATH: &str = "dist/AppDir/usr/bin/rclone";

const SYSTEM_PATHS: &[&str] = &[
    "./dist/AppDir/usr/bin/rclone",
    "/usr/bin/rclone",
    "/usr/local/bin/rclone",
    "/snap/bin/rclone",
];

/// Locate the lister binary: explicit override, bundled AppImage location,
/// beside our own executable, the staged bundle of a dev build (two
/// directories above the executable), well-known system paths, and finally a
/// bare name resolved through `PATH`.
pub fn locate_lister(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }

    if let Ok(appdir) = env::var("APPDIR") {
        let bundled = Path::new(&appdir).join("usr/bin").join(LISTER_BIN);
        if bundled.exists() {
            info!("using bundled lister: {}", bundled.display());
            return bundled;
        }
    }

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let beside = dir.join(LISTER_BIN);
            if beside.exists() {
                info!("using lister next to executable: {}", beside.display());
                return beside;
            }

            // Dev builds run the binary from a build directory two levels
            // below the project root; the staged bundle lives under dist/.
            if let Some(project_root) = dir.parent().and_then(|p| p.parent()) {
                let dev = project_root.join(BUNDLE_SUBPATH);
                if dev.exists() {
                    info!("using dev build lister: {}", dev.display());
                    return dev;
                }
            }
        }
    }

    for candidate in SYSTEM_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("using system lister: {}", path.display());
            return path.to_path_buf();
        }
    }

    debug!("no explicit lister path found, relying on PATH lookup");
    PathBuf::from(LISTER_BIN)
}

/// A process started from a since-deleted directory cannot spawn children.
/// Re-anchor the working directory to home, then `/tmp`, before any spawn.
pub fn ensure_valid_cwd() {
    if env::current_dir().is_ok() {
        return;
    }
    if let Ok(home) = env::var("HOME") {
        if env::set_current_dir(&home).is_ok() {
            debug!("working directory reset to {home}");
            return;
        }
    }
    if env::set_current_dir("/tmp").is_ok() {
        debug!("working directory reset to /tmp");
    } else {
        warn!("could not establish a valid working directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_always_wins() {
        let path = locate_lister(Some(Path::new("/opt/custom/lister")));
        assert_eq!(path, PathBuf::from("/opt/custom/lister"));
    }

    #[test]
    fn falls_back_to_path_lookup() {
        // No override; whatever the ladder resolves must at least name the binary.
        let path = locate_lister(None);
        assert!(path.to_string_lossy().contains(LISTER_BIN));
    }
}
