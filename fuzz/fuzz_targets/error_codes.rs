//! Fuzz test for native return code classification
//!
//! Any code or status must classify, describe and convert without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_native::{Error, ErrorCode, NativeError, SftpError, SftpStatus};

fuzz_target!(|input: (i32, u32, &str)| {
    let (code, status, path) = input;

    let classified = ErrorCode::from_raw(code);
    assert_eq!(classified.raw(), code);
    let _ = classified.kind();
    let _ = classified.description();

    let sftp_status = SftpStatus::from_raw(status);
    assert_eq!(sftp_status.raw(), status);

    let native: Error = NativeError::new(code, path).into();
    assert!(native.path().is_none());
    let _ = native.to_string();
    let _ = std::io::Error::from(native);

    let sftp: Error = SftpError::new(status, path).into();
    assert_eq!(sftp.path(), Some(path));
    let _ = sftp.to_string();
    let _ = std::io::Error::from(sftp);
});
