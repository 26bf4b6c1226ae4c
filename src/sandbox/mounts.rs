/*!
 * Namespace Preparer
 * Root swap for a sandbox process: /proc bind, pivot_root, old root disposal
 *
 * ## Filesystem Layout (after `pivot_root`)
 *
 * ```text
 * /
 * ├── plugin      → plugin binary shipped in the plugin root
 * ├── grpc.sock   → control socket, created by the plugin
 * └── proc/       → recursive bind mount of the host /proc
 * ```
 *
 * Every failure here is fatal. Once the pivot has begun there is no way back
 * to a consistent view, so nothing is rolled back.
 */

use super::types::{SandboxError, SandboxResult};
use crate::core::limits::{OLD_ROOT_DIR_NAME, PROC_DIR_NAME};
use nix::errno::Errno;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(target_os = "linux")]
use nix::mount::{mount, umount2, MntFlags, MsFlags};

/// Check that `root` can become the new filesystem root
///
/// Returns the canonical path. A missing path, a non-directory or a path that
/// cannot be resolved is rejected; there is no degraded mode.
pub fn validate_target(root: &Path) -> SandboxResult<PathBuf> {
    let canonical = fs::canonicalize(root).map_err(|e| SandboxError::InvalidTarget {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;

    let metadata = fs::metadata(&canonical).map_err(|e| SandboxError::InvalidTarget {
        path: canonical.clone(),
        reason: e.to_string(),
    })?;

    if !metadata.is_dir() {
        return Err(SandboxError::InvalidTarget {
            path: canonical,
            reason: "not a directory".to_string(),
        });
    }

    if canonical == Path::new("/") {
        return Err(SandboxError::InvalidTarget {
            path: canonical,
            reason: "already the filesystem root".to_string(),
        });
    }

    Ok(canonical)
}

/// Refuse to run when the mount namespace is shared with the parent
///
/// A re-entry invoked without CLONE_NEWNS would otherwise pivot the caller's root.
pub fn ensure_private_mount_namespace() -> SandboxResult<()> {
    let parent = nix::unistd::getppid();
    let own = Path::new("/proc/self/ns/mnt");
    let parents = PathBuf::from(format!("/proc/{}/ns/mnt", parent));

    if same_namespace(own, &parents)? {
        return Err(SandboxError::SharedMountNamespace);
    }
    debug!(parent = %parent, "Mount namespace differs from parent");
    Ok(())
}

/// Compare two namespace links (`mnt:[4026531840]`)
pub fn same_namespace(a: &Path, b: &Path) -> SandboxResult<bool> {
    let read = |path: &Path| {
        fs::read_link(path).map_err(|source| SandboxError::NamespaceProbe {
            path: path.display().to_string(),
            source,
        })
    };
    Ok(read(a)? == read(b)?)
}

/// Stop mount events from propagating back to the host
#[cfg(target_os = "linux")]
pub fn make_mounts_private() -> SandboxResult<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|source| SandboxError::Mount {
        operation: "make / private",
        target: PathBuf::from("/"),
        source,
    })
}

/// Bind the host /proc into `root/proc`
#[cfg(target_os = "linux")]
pub fn mount_proc(root: &Path) -> SandboxResult<()> {
    let target = root.join(PROC_DIR_NAME);
    fs::create_dir_all(&target).map_err(|e| SandboxError::InvalidTarget {
        path: target.clone(),
        reason: format!("cannot create proc mount point: {}", e),
    })?;

    mount(
        Some("/proc"),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| SandboxError::Mount {
        operation: "bind /proc",
        target: target.clone(),
        source,
    })?;

    info!(target = %target.display(), "Mounted /proc");
    Ok(())
}

/// Make `root` the filesystem root and detach the previous one
#[cfg(target_os = "linux")]
pub fn pivot_root(root: &Path) -> SandboxResult<()> {
    // pivot_root requires the new root to be a mount point
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| SandboxError::Mount {
        operation: "bind new root",
        target: root.to_path_buf(),
        source,
    })?;

    let put_old = root.join(OLD_ROOT_DIR_NAME);
    create_staging_dir(&put_old)?;

    nix::unistd::pivot_root(root, &put_old).map_err(|source| SandboxError::Pivot {
        new_root: root.to_path_buf(),
        source,
    })?;

    nix::unistd::chdir("/").map_err(|source| SandboxError::Pivot {
        new_root: root.to_path_buf(),
        source,
    })?;

    let old_root = old_root_path();
    umount2(&old_root, MntFlags::MNT_DETACH).map_err(|source| SandboxError::Mount {
        operation: "detach old root",
        target: old_root.clone(),
        source,
    })?;

    fs::remove_dir(&old_root).map_err(|e| SandboxError::Mount {
        operation: "remove old root",
        target: old_root.clone(),
        source: io_errno(&e),
    })?;

    info!(root = %root.display(), "Pivoted into plugin root");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn make_mounts_private() -> SandboxResult<()> {
    Err(SandboxError::PlatformNotSupported(
        "mount namespaces are only available on Linux".to_string(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn mount_proc(_root: &Path) -> SandboxResult<()> {
    Err(SandboxError::PlatformNotSupported(
        "mount namespaces are only available on Linux".to_string(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_root: &Path) -> SandboxResult<()> {
    Err(SandboxError::PlatformNotSupported(
        "pivot_root is only available on Linux".to_string(),
    ))
}

/// Location of the old root once the pivot has happened
pub fn old_root_path() -> PathBuf {
    Path::new("/").join(OLD_ROOT_DIR_NAME)
}

fn create_staging_dir(path: &Path) -> SandboxResult<()> {
    use std::os::unix::fs::DirBuilderExt;

    match fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(SandboxError::Mount {
            operation: "create old root staging",
            target: path.to_path_buf(),
            source: io_errno(&e),
        }),
    }
}

fn io_errno(err: &io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(Errno::EIO as i32))
}
