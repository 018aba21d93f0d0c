//! Statistics invariants over random request sequences.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use proptest::prelude::*;
use xsc_rt::{Errno, OpenFlags, Runtime, RuntimeConfig};

#[derive(Debug, Clone, Copy)]
enum Op {
    Getpid,
    Getuid,
    CloseBad,
    Pwrite { offset: u8, byte: u8 },
    Pread { offset: u8 },
    Fstat,
    Flush,
    Reset,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Getpid),
        Just(Op::Getuid),
        Just(Op::CloseBad),
        (any::<u8>(), any::<u8>()).prop_map(|(offset, byte)| Op::Pwrite { offset, byte }),
        any::<u8>().prop_map(|offset| Op::Pread { offset }),
        Just(Op::Fstat),
        Just(Op::Flush),
        Just(Op::Reset),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_counters_match_requests(
        ops in proptest::collection::vec(op(), 1..64),
        ttl_ms in 0u64..50
    ) {
        let config = RuntimeConfig::default().with_cache_ttl(Duration::from_millis(ttl_ms));
        let rt = Runtime::native(config);
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = CString::new(file.path().as_os_str().as_bytes()).unwrap();
        let fd = rt.open(&path, OpenFlags::RDWR, 0);
        prop_assert!(fd >= 0);
        rt.reset_stats();

        let mut model = vec![0u8; 256];
        let mut issued = 0u64;
        let mut failed = 0u64;

        for step in ops {
            let result: i64 = match step {
                Op::Getpid => rt.getpid() as i64,
                // SAFETY: no pointer arguments.
                Op::Getuid => unsafe { rt.dispatch(libc::SYS_getuid, [0; 6]) },
                Op::CloseBad => rt.close(-1) as i64,
                Op::Pwrite { offset, byte } => {
                    model[offset as usize] = byte;
                    rt.pwrite(fd, &[byte], offset as i64) as i64
                }
                Op::Pread { offset } => {
                    let mut buf = [0u8; 1];
                    let n = rt.pread(fd, &mut buf, offset as i64);
                    let len = std::fs::metadata(file.path()).unwrap().len();
                    if (offset as u64) < len {
                        prop_assert_eq!(n, 1);
                        prop_assert_eq!(buf[0], model[offset as usize]);
                    } else {
                        prop_assert_eq!(n, 0);
                    }
                    n as i64
                }
                Op::Fstat => {
                    // SAFETY: `stat` is plain old data.
                    let mut st: libc::stat = unsafe { std::mem::zeroed() };
                    rt.fstat(fd, &mut st) as i64
                }
                Op::Flush => {
                    rt.flush_cache();
                    continue;
                }
                Op::Reset => {
                    rt.reset_stats();
                    issued = 0;
                    failed = 0;
                    continue;
                }
            };
            issued += 1;
            if Errno::is_failure(result) {
                failed += 1;
            }

            let stats = rt.stats();
            prop_assert_eq!(
                stats.total_syscalls,
                stats.ring_transitions + stats.cached_transitions
            );
            prop_assert_eq!(stats.total_syscalls, issued);
            prop_assert_eq!(stats.failed_syscalls, failed);
        }
        rt.close(fd);
    }
}
