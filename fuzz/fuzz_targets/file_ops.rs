//! Fuzz test for file handle operations
//!
//! Drives arbitrary read/write/close sequences against the in-memory engine
//! and checks the returned counts stay within their bounds.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_native::{
    FilePermissions, MemoryEngine, MemoryTransport, OpenFlags, Operation, Session, SessionConfig,
};

#[derive(Debug, Arbitrary)]
enum Op {
    Read { capacity: u16 },
    Write { data: Vec<u8>, length: u16 },
    Stat,
    FailNext { code: i8 },
    Close,
}

#[derive(Debug, Arbitrary)]
struct Input {
    contents: Vec<u8>,
    write_limit: Option<u16>,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let engine = MemoryEngine::new().with_file("/fuzz", input.contents);
    engine.set_write_limit(input.write_limit.map(|l| usize::from(l).max(1)));

    let Ok(session) = Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default())
    else {
        return;
    };
    let Ok(sftp) = session.open_channel().and_then(|c| c.open_file_transfer()) else {
        return;
    };
    let Ok(mut file) = sftp.open_file(
        "/fuzz",
        OpenFlags::READ | OpenFlags::WRITE,
        FilePermissions::default(),
    ) else {
        return;
    };

    for op in input.ops {
        if file.is_closed() {
            break;
        }
        match op {
            Op::Read { capacity } => {
                let mut buf = vec![0u8; usize::from(capacity)];
                if let Ok(n) = file.read(&mut buf) {
                    assert!(n <= buf.len());
                }
            }
            Op::Write { data, length } => {
                let length = usize::from(length).min(data.len());
                if let Ok(n) = file.write(&data, length) {
                    assert!(n <= length);
                }
            }
            Op::Stat => {
                let _ = file.stat();
            }
            Op::FailNext { code } => {
                let code = -i32::from(code.unsigned_abs()).max(1);
                engine.fail_next(Operation::Read, code);
                engine.fail_next(Operation::Write, code);
            }
            Op::Close => file.close(),
        }
    }
    file.close();
    assert_eq!(engine.open_handles(), 0);
});
