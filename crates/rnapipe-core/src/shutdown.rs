//! Graceful shutdown support via atomic flag

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

/// Global shutdown flag, raised by the SIGTERM/SIGINT handler
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
/// Process group of the running external tool, 0 when none.
static ACTIVE_GROUP: AtomicI32 = AtomicI32::new(0);
/// Lock file to unlink on a forced exit, null when none.
static LOCK_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(ptr::null_mut());

/// Route SIGINT/SIGTERM into the shutdown flag.
///
/// First signal: set the flag; the running stage's process group is killed
/// by the executor and the run ends as interrupted.
/// Second signal: kill the running process group, remove the registered
/// lock file and exit immediately with 130.
pub fn install_signal_handlers() -> std::io::Result<()> {
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        // SAFETY: the handler only touches atomics and calls killpg, unlink
        // and _exit, all async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, || {
                if shutdown_flag().swap(true, Ordering::Relaxed) {
                    force_exit();
                }
            })?;
        }
    }
    INSTALLED.store(true, Ordering::Relaxed);
    Ok(())
}

fn force_exit() -> ! {
    let pgid = ACTIVE_GROUP.load(Ordering::Relaxed);
    let lock = LOCK_PATH.load(Ordering::Relaxed);
    unsafe {
        if pgid > 0 {
            libc::killpg(pgid, libc::SIGKILL);
        }
        if !lock.is_null() {
            libc::unlink(lock);
        }
        libc::_exit(130)
    }
}

/// Record the process group of the tool currently running.
pub(crate) fn track_group(pgid: u32) {
    if INSTALLED.load(Ordering::Relaxed) {
        ACTIVE_GROUP.store(pgid as i32, Ordering::Relaxed);
    }
}

pub(crate) fn untrack_group(pgid: u32) {
    let _ = ACTIVE_GROUP.compare_exchange(pgid as i32, 0, Ordering::Relaxed, Ordering::Relaxed);
}

/// Have a forced exit remove `path`. No-op unless signal handlers are
/// installed. Paths containing NUL are ignored.
///
/// Registered paths are leaked so the handler never reads freed memory.
pub fn guard_lock_file(path: &Path) {
    if !INSTALLED.load(Ordering::Relaxed) {
        return;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    LOCK_PATH.store(c_path.into_raw(), Ordering::Relaxed);
}

/// Undo [`guard_lock_file`] once the lock has been released normally.
pub fn unguard_lock_file() {
    LOCK_PATH.store(ptr::null_mut(), Ordering::Relaxed);
}
