//! Property-based tests for Tether
//!
//! Uses proptest to verify the read/write bounds and error dispatch across
//! large input spaces.

use proptest::prelude::*;
use tether_integration_tests::{connect, engine, open_read, open_sftp, open_write};
use tether_native::{ErrorCategory, ErrorCode, Operation, SFTP_PROTOCOL_ERROR, SftpStatus};

// ============================================================================
// Read/Write Bounds
// ============================================================================

mod io_properties {
    use super::*;

    proptest! {
        /// Every read returns at most the buffer size, and the reads
        /// concatenate to the file contents.
        #[test]
        fn read_never_exceeds_buffer(
            contents in prop::collection::vec(any::<u8>(), 0..4096),
            capacity in 1usize..512,
        ) {
            let engine = engine().with_file("/srv/blob", contents.clone());
            let session = connect(&engine);
            let sftp = open_sftp(&session);
            let mut file = open_read(&sftp, "/srv/blob");

            let mut buf = vec![0u8; capacity];
            let mut out = Vec::new();
            loop {
                let n = file.read(&mut buf).unwrap();
                prop_assert!(n <= capacity);
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(out, contents);
        }

        /// A write accepts at most `length` bytes, whatever the server cap.
        #[test]
        fn write_never_exceeds_length(
            data in prop::collection::vec(any::<u8>(), 1..1024),
            length_fraction in 0.0f64..=1.0,
            limit in prop::option::of(1usize..256),
        ) {
            let length = ((data.len() as f64) * length_fraction) as usize;
            let engine = engine();
            engine.set_write_limit(limit);
            let session = connect(&engine);
            let sftp = open_sftp(&session);
            let mut file = open_write(&sftp, "/var/tmp/out");

            let n = file.write(&data, length).unwrap();
            prop_assert!(n <= length);
            if let Some(limit) = limit {
                prop_assert!(n <= limit);
            }
            prop_assert_eq!(engine.file_contents("/var/tmp/out").unwrap(), &data[..n]);
        }
    }
}

// ============================================================================
// Error Dispatch
// ============================================================================

mod error_properties {
    use super::*;

    proptest! {
        /// The sentinel always becomes a subsystem error naming the path.
        #[test]
        fn sentinel_carries_path(
            path in "/[a-z0-9_./-]{1,40}",
            status in 1u32..=21,
        ) {
            let engine = engine();
            let session = connect(&engine);
            let sftp = open_sftp(&session);

            engine.fail_next_sftp(Operation::Stat, SftpStatus::from_raw(status));
            let err = sftp.stat(&path).unwrap_err();
            prop_assert_eq!(err.category(), ErrorCategory::Subsystem);
            prop_assert_eq!(err.path(), Some(path.as_str()));
            prop_assert_eq!(err.code(), Some(i64::from(status)));
        }

        /// Any other negative code becomes a transport error without a path.
        #[test]
        fn other_codes_have_no_path(
            code in (-51i32..=-1).prop_filter("not the sentinel", |c| *c != SFTP_PROTOCOL_ERROR),
        ) {
            let engine = engine();
            let session = connect(&engine);
            let sftp = open_sftp(&session);

            engine.fail_next(Operation::Stat, code);
            let err = sftp.stat("/etc/hostname").unwrap_err();
            prop_assert_eq!(err.category(), ErrorCategory::Transport);
            prop_assert_eq!(err.path(), None);
            prop_assert_eq!(err.code(), Some(i64::from(code)));
        }

        /// Error codes survive classification unchanged.
        #[test]
        fn error_code_roundtrip(code in any::<i32>()) {
            prop_assert_eq!(ErrorCode::from_raw(code).raw(), code);
        }

        /// SFTP statuses survive classification unchanged.
        #[test]
        fn sftp_status_roundtrip(status in any::<u32>()) {
            prop_assert_eq!(SftpStatus::from_raw(status).raw(), status);
        }
    }
}
