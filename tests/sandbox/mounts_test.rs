/*!
 * Namespace Preparer Tests
 * Checks that run without privileges
 */

use pluginbox::sandbox::mounts::{same_namespace, validate_target};
use pluginbox::sandbox::SandboxError;
use std::fs;
use std::path::Path;

#[test]
fn test_validate_target_accepts_directory() {
    let dir = tempfile::tempdir().unwrap();

    let canonical = validate_target(dir.path()).unwrap();

    assert_eq!(canonical, fs::canonicalize(dir.path()).unwrap());
}

#[test]
fn test_validate_target_rejects_missing_path() {
    let dir = tempfile::tempdir().unwrap();

    let err = validate_target(&dir.path().join("absent")).unwrap_err();

    assert!(matches!(err, SandboxError::InvalidTarget { .. }));
    assert_eq!(err.exit_code(), 125);
}

#[test]
fn test_validate_target_rejects_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plugin");
    fs::write(&file, b"").unwrap();

    assert!(validate_target(&file).is_err());
}

#[test]
fn test_validate_target_rejects_current_root() {
    assert!(validate_target(Path::new("/")).is_err());
}

#[test]
fn test_own_namespace_matches_itself() {
    let own = Path::new("/proc/self/ns/mnt");
    assert!(same_namespace(own, own).unwrap());
}

#[test]
fn test_namespace_probe_error() {
    let err = same_namespace(
        Path::new("/proc/self/ns/mnt"),
        Path::new("/proc/0/ns/mnt"),
    )
    .unwrap_err();
    assert!(matches!(err, SandboxError::NamespaceProbe { .. }));
}
