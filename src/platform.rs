//! Platform filesystem primitives: symlink-precision metadata restoration
//! and metadata capture for archiving.
//!
//! The unix implementations go through libc so that symlinks are never
//! followed; elsewhere, std covers regular files and directories and
//! symlink metadata is left untouched.

#![allow(unsafe_code)]

use crate::mode::EntryMode;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::SystemTime;

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::MetadataExt;

    fn cpath(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))
    }

    /// Changes permission bits without following symlinks.
    ///
    /// Linux has no symlink permissions, so symlinks are a no-op there;
    /// elsewhere fchmodat is told not to follow.
    pub(crate) fn lchmod(path: &Path, mode: EntryMode) -> io::Result<()> {
        let flags = if cfg!(target_os = "linux") {
            if mode.is_symlink() {
                return Ok(());
            }
            0
        } else {
            libc::AT_SYMLINK_NOFOLLOW
        };

        let path = cpath(path)?;
        let rc = unsafe {
            libc::fchmodat(
                libc::AT_FDCWD,
                path.as_ptr(),
                (mode.value() & 0o7777) as libc::mode_t,
                flags,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sets access and modification times at symlink precision.
    pub(crate) fn lchtimes(path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let times = [timespec(atime), timespec(mtime)];
        let path = cpath(path)?;
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn timespec(time: SystemTime) -> libc::timespec {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as _,
        }
    }

    /// Changes ownership without following symlinks.
    pub(crate) fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        let path = cpath(path)?;
        let rc = unsafe { libc::lchown(path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn symlink(target: &str, path: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, path)
    }

    pub(crate) fn entry_mode(metadata: &Metadata) -> EntryMode {
        EntryMode::from_unix(metadata.mode())
    }

    pub(crate) fn unix_ids(metadata: &Metadata) -> Option<(u32, u32)> {
        Some((metadata.uid(), metadata.gid()))
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub(crate) fn lchmod(path: &Path, mode: EntryMode) -> io::Result<()> {
        if mode.is_symlink() {
            return Ok(());
        }
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_readonly(mode.permissions() & 0o200 == 0);
        std::fs::set_permissions(path, permissions)
    }

    pub(crate) fn lchtimes(path: &Path, _atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        if std::fs::symlink_metadata(path)?.is_symlink() {
            return Ok(());
        }
        let file = std::fs::File::options().write(true).open(path)?;
        file.set_modified(mtime)
    }

    pub(crate) fn lchown(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn symlink(target: &str, path: &Path) -> io::Result<()> {
        #[cfg(windows)]
        return std::os::windows::fs::symlink_file(target, path);
        #[cfg(not(windows))]
        {
            let _ = (target, path);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "symlinks are not supported on this platform",
            ))
        }
    }

    pub(crate) fn entry_mode(metadata: &Metadata) -> EntryMode {
        let file_type = metadata.file_type();
        let mode = if file_type.is_dir() {
            0o040777
        } else if file_type.is_symlink() {
            0o120777
        } else if metadata.permissions().readonly() {
            0o100444
        } else {
            0o100666
        };
        EntryMode::from_unix(mode)
    }

    pub(crate) fn unix_ids(_metadata: &Metadata) -> Option<(u32, u32)> {
        None
    }
}

pub(crate) use imp::{entry_mode, lchmod, lchown, lchtimes, symlink, unix_ids};
