//! In-memory kernel used by unit tests.
//!
//! Implements just enough of the file and process surface to observe
//! exactly when, and in which batches, requests cross the boundary.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::Arc;

use spin::Mutex;

use crate::error::TransitionError;
use crate::request::{RequestDescriptor, Sysno};

use super::Transport;

#[derive(Default)]
struct Files {
    next_fd: i64,
    paths: HashMap<String, usize>,
    inodes: Vec<Vec<u8>>,
    /// fd -> (inode, stream offset)
    fds: HashMap<i64, (usize, usize)>,
}

struct Stall {
    arrivals: Arc<AtomicUsize>,
    expected: usize,
    hold: Duration,
}

#[derive(Default)]
struct Inner {
    files: Mutex<Files>,
    crossings: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    ops: Mutex<Vec<Sysno>>,
    stall: Mutex<Option<Stall>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeKernel {
    inner: Arc<Inner>,
}

fn errno(code: i32) -> i64 {
    -(code as i64)
}

impl FakeKernel {
    pub const PID: i64 = 4242;

    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.inner.files.lock().next_fd = 3;
        kernel
    }

    /// Make the next crossing wait until `expected` callers have arrived,
    /// then hold it for `hold` so they pile up behind it.
    pub fn stall_next(&self, arrivals: Arc<AtomicUsize>, expected: usize, hold: Duration) {
        *self.inner.stall.lock() = Some(Stall {
            arrivals,
            expected,
            hold,
        });
    }

    pub fn crossings(&self) -> usize {
        self.inner.crossings.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batches.lock().clone()
    }

    /// Every operation executed, in crossing order.
    pub fn ops(&self) -> Vec<Sysno> {
        self.inner.ops.lock().clone()
    }

    /// Contents of a file, by path.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let files = self.inner.files.lock();
        files.paths.get(path).map(|&ino| files.inodes[ino].clone())
    }

    fn execute(&self, desc: &RequestDescriptor) -> i64 {
        let [a1, a2, a3, a4, ..] = desc.arguments;
        let mut files = self.inner.files.lock();
        match desc.operation {
            libc::SYS_getpid => Self::PID,
            // Every clone returns in the child.
            libc::SYS_clone => 0,
            libc::SYS_openat => {
                // SAFETY: tests pass NUL-terminated paths.
                let path = unsafe { CStr::from_ptr(a2 as usize as *const libc::c_char) };
                let path = path.to_string_lossy().into_owned();
                let ino = match files.paths.get(&path) {
                    Some(&ino) => ino,
                    None if a3 as i32 & libc::O_CREAT != 0 => {
                        files.inodes.push(Vec::new());
                        let ino = files.inodes.len() - 1;
                        files.paths.insert(path, ino);
                        ino
                    }
                    None => return errno(libc::ENOENT),
                };
                let fd = files.next_fd;
                files.next_fd += 1;
                files.fds.insert(fd, (ino, 0));
                fd
            }
            libc::SYS_dup => match files.fds.get(&a1).copied() {
                Some(open) => {
                    let fd = files.next_fd;
                    files.next_fd += 1;
                    files.fds.insert(fd, open);
                    fd
                }
                None => errno(libc::EBADF),
            },
            libc::SYS_close => match files.fds.remove(&a1) {
                Some(_) => 0,
                None => errno(libc::EBADF),
            },
            libc::SYS_write | libc::SYS_pwrite64 => {
                let Some(&(ino, offset)) = files.fds.get(&a1) else {
                    return errno(libc::EBADF);
                };
                let at = if desc.operation == libc::SYS_write {
                    offset
                } else {
                    a4 as usize
                };
                let len = a3 as usize;
                // SAFETY: tests pass live buffers of at least `len` bytes.
                let src = unsafe { core::slice::from_raw_parts(a2 as usize as *const u8, len) };
                let data = &mut files.inodes[ino];
                if data.len() < at + len {
                    data.resize(at + len, 0);
                }
                data[at..at + len].copy_from_slice(src);
                if desc.operation == libc::SYS_write {
                    files.fds.insert(a1, (ino, offset + len));
                }
                len as i64
            }
            libc::SYS_read | libc::SYS_pread64 => {
                let Some(&(ino, offset)) = files.fds.get(&a1) else {
                    return errno(libc::EBADF);
                };
                let at = if desc.operation == libc::SYS_read {
                    offset
                } else {
                    a4 as usize
                };
                let data = &files.inodes[ino];
                let len = (a3 as usize).min(data.len().saturating_sub(at));
                // SAFETY: tests pass live buffers of at least `a3` bytes.
                let dst = unsafe { core::slice::from_raw_parts_mut(a2 as usize as *mut u8, len) };
                dst.copy_from_slice(&data[at..at + len]);
                if desc.operation == libc::SYS_read {
                    files.fds.insert(a1, (ino, offset + len));
                }
                len as i64
            }
            _ => errno(libc::ENOSYS),
        }
    }
}

impl Transport for FakeKernel {
    fn name(&self) -> &'static str {
        "fake-kernel"
    }

    fn cross(&self, batch: &mut [RequestDescriptor]) -> Result<usize, TransitionError> {
        self.inner.crossings.fetch_add(1, Ordering::SeqCst);
        let stall = self.inner.stall.lock().take();
        if let Some(stall) = stall {
            while stall.arrivals.load(Ordering::SeqCst) < stall.expected {
                std::thread::yield_now();
            }
            std::thread::sleep(stall.hold);
        }

        self.inner.batches.lock().push(batch.len());
        for desc in batch.iter_mut() {
            self.inner.ops.lock().push(desc.operation);
            desc.result = self.execute(desc);
        }
        Ok(batch.len())
    }
}
