//! Mount facility backed by the host kernel.

use std::path::{Path, PathBuf};

use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

use super::Mounter;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mounts through `mount(2)` and reads `/proc/self/mountinfo`.
#[derive(Debug, Default, Clone)]
pub struct SystemMounter;

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }
}

impl Mounter for SystemMounter {
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        // Fails with NotFound for a missing path.
        let path = std::fs::canonicalize(path)?;
        let mountinfo = std::fs::read_to_string(MOUNTINFO)?;
        Ok(mount_points(&mountinfo).any(|mp| mp == path))
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> ImagevolResult<()> {
        let (flags, data) = parse_options(options);
        let data = (!data.is_empty()).then_some(data.as_str());
        let is_bind = flags.contains(MsFlags::MS_BIND);

        // A bind mount ignores every flag but MS_REC on the first call.
        let initial = if is_bind {
            flags & (MsFlags::MS_BIND | MsFlags::MS_REC)
        } else {
            flags
        };

        mount(Some(source), target, fs_type, initial, data).map_err(|e| {
            ImagevolError::Mount(format!(
                "Failed to mount {} to {} (options {:?}): {}",
                source.display(),
                target.display(),
                options,
                e
            ))
        })?;

        let remount = flags - (MsFlags::MS_BIND | MsFlags::MS_REC);
        if is_bind && !remount.is_empty() {
            let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | remount;
            if let Err(e) = mount(None::<&str>, target, None::<&str>, flags, None::<&str>) {
                // Do not leave a writable mount behind a failed read-only request.
                let _ = umount2(target, MntFlags::MNT_DETACH);
                return Err(ImagevolError::Mount(format!(
                    "Failed to apply {:?} to {}: {}",
                    options,
                    target.display(),
                    e
                )));
            }
        }

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            options = ?options,
            "Mounted"
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> ImagevolResult<()> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            // Not mounted, or gone
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(ImagevolError::Mount(format!(
                "Failed to unmount {}: {}",
                target.display(),
                e
            ))),
        }
    }
}

/// Split mount options into kernel flags and filesystem data.
fn parse_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data: Vec<&str> = Vec::new();

    for option in options {
        match option.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags -= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "defaults" | "" => {}
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

/// Mount point column (field 5) of every mountinfo line.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
}

/// Undo the kernel's `\NNN` escaping of spaces, tabs, newlines and backslashes.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && let Ok(digits) = std::str::from_utf8(&bytes[i + 1..i + 4])
            && let Ok(code) = u8::from_str_radix(digits, 8)
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
35 22 0:31 / /proc rw,nosuid,nodev,noexec shared:12 - proc proc rw
97 22 8:1 /var/lib/imagevol/volumes/v1/content /var/lib/kubelet/pods/p/volumes/v1/mount ro,relatime shared:1 - ext4 /dev/sda1 rw
98 22 8:1 /data /mnt/with\\040space rw shared:1 - ext4 /dev/sda1 rw
";

    #[test]
    fn test_mount_points_parsed() {
        let points: Vec<_> = mount_points(SAMPLE).collect();
        assert_eq!(points.len(), 4);
        assert!(points.contains(&PathBuf::from("/proc")));
        assert!(points.contains(&PathBuf::from("/var/lib/kubelet/pods/p/volumes/v1/mount")));
    }

    #[test]
    fn test_escaped_space() {
        assert_eq!(unescape_octal("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_octal("/plain"), "/plain");
        assert_eq!(unescape_octal("/trailing\\"), "/trailing\\");
        let points: Vec<_> = mount_points(SAMPLE).collect();
        assert!(points.contains(&PathBuf::from("/mnt/with space")));
    }

    #[test]
    fn test_parse_bind_ro() {
        let (flags, data) = parse_options(&["bind".into(), "ro".into()]);
        assert_eq!(flags, MsFlags::MS_BIND | MsFlags::MS_RDONLY);
        assert!(data.is_empty());
    }

    #[test]
    fn test_parse_passes_unknown_to_data() {
        let (flags, data) = parse_options(&[
            "bind".into(),
            "nosuid".into(),
            "context=system_u".into(),
            "uid=1000".into(),
        ]);
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert_eq!(data, "context=system_u,uid=1000");
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let err = SystemMounter::new()
            .is_mount_point(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
