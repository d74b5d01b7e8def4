//! Platform-specific durable sync
//!
//! A commit is only durable once the partition image bytes (and, after a
//! create, rename or delete, the directory entry) reach persistent storage.
//! These helpers map to the strongest primitive each platform offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures file data is durably written to persistent storage before returning.
///
/// - Linux: `fdatasync()`
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`, plain fsync stops at the drive cache
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
///
/// May block for a long time under heavy I/O; do not call while holding a
/// lock other threads need.
pub fn durable_sync(file: &File) -> io::Result<()> {
    sync_impl(file)
}

/// Persist directory metadata after creating, renaming or removing the image.
///
/// Windows has no directory handle to flush; `FlushFileBuffers` on the image
/// already covers the rename there, so this is a no-op.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        sync_impl(&handle)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd comes from a live File reference, so it is open for the call.
    let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd comes from a live File reference, so it is open for the call.
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "windows")]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::FlushFileBuffers;
    // SAFETY: the handle comes from a live File reference.
    let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
    if result != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
fn sync_impl(file: &File) -> io::Result<()> {
    file.sync_data()
}
