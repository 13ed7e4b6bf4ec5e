//! Node-side mount operations.
//!
//! Wraps the host's mount/umount tooling for the private-staging and
//! bind-mount scheme the node service uses: a volume's device is mounted
//! once under the private directory and bind-mounted into each target path.
//! All operations are idempotent against the current mount table.

use std::fs;
use std::path::Path;
use std::process::Command;

use tonic::Status;
use tracing::{debug, warn};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub path: String,
}

/// Validate that a path is safe to pass to mount tooling.
pub fn validate_path(path: &str) -> Result<(), Status> {
    if path.is_empty() {
        return Err(Status::invalid_argument("Path cannot be empty"));
    }

    if !path.starts_with('/') {
        return Err(Status::invalid_argument("Path must be absolute"));
    }

    // Disallow characters that could enable shell injection
    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
    ];
    for c in dangerous_chars {
        if path.contains(c) {
            return Err(Status::invalid_argument(format!(
                "Path contains dangerous character: '{}'",
                c
            )));
        }
    }

    if path.contains("..") {
        return Err(Status::invalid_argument(
            "Path cannot contain '..' (path traversal)",
        ));
    }

    Ok(())
}

/// Parse mount-table content in /proc/self/mounts format.
fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                path: unescape_mount_field(path),
            })
        })
        .collect()
}

/// The kernel escapes whitespace and backslashes in mount fields as octal.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Read the current mount table.
pub fn mounts() -> Result<Vec<MountEntry>, Status> {
    let content = fs::read_to_string("/proc/self/mounts")
        .map_err(|e| Status::internal(format!("reading mount table: {}", e)))?;
    Ok(parse_mounts(&content))
}

/// Whether anything is mounted at `target`.
pub fn is_mounted(target: &Path) -> Result<bool, Status> {
    let target = target.to_string_lossy();
    Ok(mounts()?.iter().any(|m| m.path == target))
}

fn run(program: &str, args: &[&str]) -> Result<(), Status> {
    debug!(program, ?args, "running mount tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Status::internal(format!("failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(Status::internal(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Bind-mount a raw device node onto `target`, creating the target file.
pub fn publish_block(device: &Path, target: &Path, readonly: bool) -> Result<(), Status> {
    if is_mounted(target)? {
        debug!(target = %target.display(), "target already mounted");
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Status::internal(format!("creating target parent: {}", e)))?;
    }
    if !target.exists() {
        fs::File::create(target)
            .map_err(|e| Status::internal(format!("creating target file: {}", e)))?;
    }

    bind(device, target, readonly)
}

/// Mount `device` under the private staging path and bind it onto `target`.
///
/// The device is formatted on first use: a failed mount is retried once
/// after making the filesystem.
pub fn publish_mount(
    device: &Path,
    staging: &Path,
    target: &Path,
    fs_type: &str,
    mount_flags: &[String],
    readonly: bool,
) -> Result<(), Status> {
    if is_mounted(target)? {
        debug!(target = %target.display(), "target already mounted");
        return Ok(());
    }

    fs::create_dir_all(staging)
        .map_err(|e| Status::internal(format!("creating staging dir: {}", e)))?;

    if !is_mounted(staging)? {
        mount_device(device, staging, fs_type, mount_flags)?;
    }

    fs::create_dir_all(target)
        .map_err(|e| Status::internal(format!("creating target dir: {}", e)))?;

    bind(staging, target, readonly)
}

fn mount_device(
    device: &Path,
    staging: &Path,
    fs_type: &str,
    mount_flags: &[String],
) -> Result<(), Status> {
    let device_str = device.to_string_lossy();
    let staging_str = staging.to_string_lossy();
    let options = mount_flags.join(",");

    let mut args = vec!["-t", fs_type];
    if !options.is_empty() {
        args.extend(["-o", options.as_str()]);
    }
    args.extend([device_str.as_ref(), staging_str.as_ref()]);

    if run("mount", &args).is_ok() {
        return Ok(());
    }

    // The device may be unformatted; make the filesystem and retry once.
    warn!(device = %device_str, fs_type, "mount failed, formatting device");
    run("mkfs", &["-t", fs_type, device_str.as_ref()])?;
    run("mount", &args)
}

fn bind(source: &Path, target: &Path, readonly: bool) -> Result<(), Status> {
    let source_str = source.to_string_lossy();
    let target_str = target.to_string_lossy();

    run("mount", &["--bind", source_str.as_ref(), target_str.as_ref()])?;
    if readonly {
        run("mount", &["-o", "remount,ro,bind", target_str.as_ref()])?;
    }
    Ok(())
}

/// Unmount `target` if it is mounted; already unmounted is a success.
pub fn unmount_if_mounted(target: &Path) -> Result<(), Status> {
    if !is_mounted(target)? {
        debug!(target = %target.display(), "target not mounted");
        return Ok(());
    }
    run("umount", &[target.to_string_lossy().as_ref()])
}

/// Best-effort unmount of a private staging mount; a busy staging mount
/// (still bind-mounted elsewhere) is left in place.
pub fn release_staging(staging: &Path) {
    match is_mounted(staging) {
        Ok(true) => {
            if let Err(e) = run("umount", &[staging.to_string_lossy().as_ref()]) {
                debug!(staging = %staging.display(), error = %e.message(), "staging still in use");
            }
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e.message(), "unable to read mount table");
        }
    }
}
