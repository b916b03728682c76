//! [`Engine`] implementation over the libssh2 C library.

use std::ffi::{CStr, c_char, c_int, c_long, c_uint, c_ulong};
use std::net::TcpStream;
use std::ptr;
use std::slice;

use libssh2_sys as raw;

use crate::engine::{Engine, OpenKind, StreamId};
use crate::types::{FileAttributes, FilePermissions, OpenFlags};

// libssh2.h constants not re-exported under stable names by every libssh2-sys release
const CHANNEL_WINDOW_DEFAULT: c_uint = 2 * 1024 * 1024;
const CHANNEL_PACKET_DEFAULT: c_uint = 32768;
const HOSTKEY_HASH_SHA256: c_int = 3;
const DISCONNECT_BY_APPLICATION: c_int = 11;
const SFTP_OPENFILE: c_int = 0;
const SFTP_OPENDIR: c_int = 1;
const SFTP_STAT: c_int = 0;
const SFTP_FSTAT_GET: c_int = 0;
const ATTR_SIZE: c_ulong = 0x01;
const ATTR_UIDGID: c_ulong = 0x02;
const ATTR_PERMISSIONS: c_ulong = 0x04;
const ATTR_ACMODTIME: c_ulong = 0x08;

/// Engine backed by libssh2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Libssh2Engine;

impl Libssh2Engine {
    /// Initialize the library (once per process) and return the engine.
    #[must_use]
    pub fn new() -> Self {
        raw::init();
        Self
    }
}

/// Raw `LIBSSH2_SESSION` plus the socket it runs over.
pub struct RawSession {
    ptr: *mut raw::LIBSSH2_SESSION,
    socket: Option<TcpStream>,
}

/// Raw `LIBSSH2_CHANNEL`.
pub struct RawChannel {
    ptr: *mut raw::LIBSSH2_CHANNEL,
}

/// Raw `LIBSSH2_SFTP`.
pub struct RawSftp {
    ptr: *mut raw::LIBSSH2_SFTP,
}

/// Raw `LIBSSH2_SFTP_HANDLE`.
pub struct RawSftpHandle {
    ptr: *mut raw::LIBSSH2_SFTP_HANDLE,
}

// SAFETY: the pointers are only dereferenced by libssh2, and the handle layer
// guarantees every call on an object comes from that object's owning thread.
// Moving the pointer between threads without using it is sound.
unsafe impl Send for RawSession {}
unsafe impl Sync for RawSession {}
unsafe impl Send for RawChannel {}
unsafe impl Sync for RawChannel {}
unsafe impl Send for RawSftp {}
unsafe impl Sync for RawSftp {}
unsafe impl Send for RawSftpHandle {}
unsafe impl Sync for RawSftpHandle {}

fn opt_ptr(s: Option<&CStr>) -> *const c_char {
    s.map_or(ptr::null(), CStr::as_ptr)
}

fn attributes_from_raw(attrs: &raw::LIBSSH2_SFTP_ATTRIBUTES) -> FileAttributes {
    let has = |flag: c_ulong| attrs.flags & flag == flag;
    FileAttributes {
        size: has(ATTR_SIZE).then_some(attrs.filesize as u64),
        uid: has(ATTR_UIDGID).then_some(attrs.uid as u32),
        gid: has(ATTR_UIDGID).then_some(attrs.gid as u32),
        permissions: has(ATTR_PERMISSIONS).then_some(attrs.permissions as u32),
        atime: has(ATTR_ACMODTIME).then_some(attrs.atime as u64),
        mtime: has(ATTR_ACMODTIME).then_some(attrs.mtime as u64),
    }
}

fn zeroed_attributes() -> raw::LIBSSH2_SFTP_ATTRIBUTES {
    // SAFETY: LIBSSH2_SFTP_ATTRIBUTES is a plain C struct of integers.
    unsafe { std::mem::zeroed() }
}

impl Engine for Libssh2Engine {
    type Transport = TcpStream;
    type Session = RawSession;
    type Channel = RawChannel;
    type Sftp = RawSftp;
    type File = RawSftpHandle;

    fn session_init(&self) -> Option<RawSession> {
        raw::init();
        // SAFETY: null allocator callbacks select libssh2's defaults.
        let ptr = unsafe { raw::libssh2_session_init_ex(None, None, None, ptr::null_mut()) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: ptr is a live session.
        unsafe { raw::libssh2_session_set_blocking(ptr, 1) };
        Some(RawSession { ptr, socket: None })
    }

    fn session_set_timeout(&self, session: &RawSession, timeout_ms: u32) {
        // SAFETY: session.ptr is live until session_free.
        unsafe { raw::libssh2_session_set_timeout(session.ptr, timeout_ms as c_long) }
    }

    fn session_handshake(&self, session: &mut RawSession, transport: TcpStream) -> i32 {
        #[cfg(unix)]
        let socket = {
            use std::os::unix::io::AsRawFd;
            transport.as_raw_fd() as raw::libssh2_socket_t
        };
        #[cfg(windows)]
        let socket = {
            use std::os::windows::io::AsRawSocket;
            transport.as_raw_socket() as raw::libssh2_socket_t
        };
        // The socket must outlive the session, so the session keeps it.
        session.socket = Some(transport);
        // SAFETY: session.ptr is live and socket is a connected stream owned by the session.
        unsafe { raw::libssh2_session_handshake(session.ptr, socket) }
    }

    fn session_banner(&self, session: &RawSession) -> Option<String> {
        // SAFETY: the banner string is owned by the session and NUL terminated.
        unsafe {
            let banner = raw::libssh2_session_banner_get(session.ptr);
            if banner.is_null() {
                None
            } else {
                Some(CStr::from_ptr(banner).to_string_lossy().into_owned())
            }
        }
    }

    fn session_host_key_sha256(&self, session: &RawSession) -> Option<[u8; 32]> {
        // SAFETY: a non-null SHA-256 host key hash is 32 bytes owned by the session.
        unsafe {
            let hash = raw::libssh2_hostkey_hash(session.ptr, HOSTKEY_HASH_SHA256);
            if hash.is_null() {
                return None;
            }
            let bytes = slice::from_raw_parts(hash as *const u8, 32);
            let mut out = [0u8; 32];
            out.copy_from_slice(bytes);
            Some(out)
        }
    }

    fn session_userauth_password(&self, session: &RawSession, username: &CStr, password: &CStr) -> i32 {
        // SAFETY: both strings are NUL terminated and their lengths exclude the terminator.
        unsafe {
            raw::libssh2_userauth_password_ex(
                session.ptr,
                username.as_ptr(),
                username.to_bytes().len() as c_uint,
                password.as_ptr(),
                password.to_bytes().len() as c_uint,
                None,
            )
        }
    }

    fn session_userauth_publickey_file(
        &self,
        session: &RawSession,
        username: &CStr,
        public_key: Option<&CStr>,
        private_key: &CStr,
        passphrase: Option<&CStr>,
    ) -> i32 {
        // SAFETY: all strings are NUL terminated; optional ones may be null.
        unsafe {
            raw::libssh2_userauth_publickey_fromfile_ex(
                session.ptr,
                username.as_ptr(),
                username.to_bytes().len() as c_uint,
                opt_ptr(public_key),
                private_key.as_ptr(),
                opt_ptr(passphrase),
            )
        }
    }

    fn session_authenticated(&self, session: &RawSession) -> bool {
        // SAFETY: session.ptr is live.
        unsafe { raw::libssh2_userauth_authenticated(session.ptr) != 0 }
    }

    fn session_keepalive_config(&self, session: &RawSession, want_reply: bool, interval_secs: u32) {
        // SAFETY: session.ptr is live.
        unsafe {
            raw::libssh2_keepalive_config(session.ptr, c_int::from(want_reply), interval_secs as c_uint)
        }
    }

    fn session_keepalive_send(&self, session: &RawSession, seconds_to_next: &mut i32) -> i32 {
        let mut next: c_int = 0;
        // SAFETY: session.ptr is live and next is a valid out pointer.
        let rc = unsafe { raw::libssh2_keepalive_send(session.ptr, &mut next) };
        *seconds_to_next = next;
        rc
    }

    fn session_last_errno(&self, session: &RawSession) -> i32 {
        // SAFETY: session.ptr is live.
        unsafe { raw::libssh2_session_last_errno(session.ptr) }
    }

    fn session_last_error(&self, session: &RawSession) -> (i32, String) {
        let mut msg: *mut c_char = ptr::null_mut();
        let mut len: c_int = 0;
        // SAFETY: want_buf = 0 returns a pointer into session-owned storage of `len` bytes.
        unsafe {
            let code = raw::libssh2_session_last_error(session.ptr, &mut msg, &mut len, 0);
            let message = if msg.is_null() || len <= 0 {
                String::new()
            } else {
                let bytes = slice::from_raw_parts(msg as *const u8, len as usize);
                String::from_utf8_lossy(bytes).into_owned()
            };
            (code, message)
        }
    }

    fn session_disconnect(&self, session: &RawSession, description: &CStr) -> i32 {
        // SAFETY: session.ptr is live; the strings are NUL terminated.
        unsafe {
            raw::libssh2_session_disconnect_ex(
                session.ptr,
                DISCONNECT_BY_APPLICATION,
                description.as_ptr(),
                c"".as_ptr(),
            )
        }
    }

    fn session_free(&self, session: &mut RawSession) -> i32 {
        if session.ptr.is_null() {
            return 0;
        }
        // SAFETY: session.ptr is live and nulled right after so it is freed once.
        let rc = unsafe { raw::libssh2_session_free(session.ptr) };
        session.ptr = ptr::null_mut();
        session.socket = None;
        rc
    }

    fn channel_open_session(&self, session: &RawSession) -> Option<RawChannel> {
        const KIND: &[u8] = b"session";
        // SAFETY: session.ptr is live; KIND is passed with its length.
        let ptr = unsafe {
            raw::libssh2_channel_open_ex(
                session.ptr,
                KIND.as_ptr() as *const c_char,
                KIND.len() as c_uint,
                CHANNEL_WINDOW_DEFAULT,
                CHANNEL_PACKET_DEFAULT,
                ptr::null(),
                0,
            )
        };
        (!ptr.is_null()).then_some(RawChannel { ptr })
    }

    fn channel_process_startup(&self, channel: &RawChannel, request: &str, message: Option<&[u8]>) -> i32 {
        let (msg, msg_len) = message.map_or((ptr::null(), 0), |m| (m.as_ptr() as *const c_char, m.len()));
        // SAFETY: channel.ptr is live; request and message are passed with their lengths.
        unsafe {
            raw::libssh2_channel_process_startup(
                channel.ptr,
                request.as_ptr() as *const c_char,
                request.len() as c_uint,
                msg,
                msg_len as c_uint,
            )
        }
    }

    fn channel_request_pty(&self, channel: &RawChannel, term: &str, cols: u32, rows: u32) -> i32 {
        // SAFETY: channel.ptr is live; term is passed with its length, no modes.
        unsafe {
            raw::libssh2_channel_request_pty_ex(
                channel.ptr,
                term.as_ptr() as *const c_char,
                term.len() as c_uint,
                ptr::null(),
                0,
                cols as c_int,
                rows as c_int,
                0,
                0,
            )
        }
    }

    fn channel_request_pty_size(&self, channel: &RawChannel, cols: u32, rows: u32) -> i32 {
        // SAFETY: channel.ptr is live.
        unsafe { raw::libssh2_channel_request_pty_size_ex(channel.ptr, cols as c_int, rows as c_int, 0, 0) }
    }

    fn channel_read(&self, channel: &RawChannel, stream: StreamId, buf: &mut [u8]) -> isize {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        unsafe {
            raw::libssh2_channel_read_ex(
                channel.ptr,
                stream.raw(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as _,
            ) as isize
        }
    }

    fn channel_write(&self, channel: &RawChannel, stream: StreamId, buf: &[u8]) -> isize {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        unsafe {
            raw::libssh2_channel_write_ex(
                channel.ptr,
                stream.raw(),
                buf.as_ptr() as *const c_char,
                buf.len() as _,
            ) as isize
        }
    }

    fn channel_send_eof(&self, channel: &RawChannel) -> i32 {
        // SAFETY: channel.ptr is live.
        unsafe { raw::libssh2_channel_send_eof(channel.ptr) }
    }

    fn channel_eof(&self, channel: &RawChannel) -> bool {
        // SAFETY: channel.ptr is live.
        unsafe { raw::libssh2_channel_eof(channel.ptr) != 0 }
    }

    fn channel_wait_closed(&self, channel: &RawChannel) -> i32 {
        // SAFETY: channel.ptr is live.
        unsafe { raw::libssh2_channel_wait_closed(channel.ptr) }
    }

    fn channel_exit_status(&self, channel: &RawChannel) -> i32 {
        // SAFETY: channel.ptr is live.
        unsafe { raw::libssh2_channel_get_exit_status(channel.ptr) }
    }

    fn channel_close(&self, channel: &RawChannel) -> i32 {
        // SAFETY: channel.ptr is live.
        unsafe { raw::libssh2_channel_close(channel.ptr) }
    }

    fn channel_free(&self, channel: &mut RawChannel) -> i32 {
        if channel.ptr.is_null() {
            return 0;
        }
        // SAFETY: channel.ptr is live and nulled right after so it is freed once.
        let rc = unsafe { raw::libssh2_channel_free(channel.ptr) };
        channel.ptr = ptr::null_mut();
        rc
    }

    fn sftp_init(&self, session: &RawSession, _channel: &RawChannel) -> Option<RawSftp> {
        // libssh2 opens and negotiates its own subsystem channel.
        // SAFETY: session.ptr is live.
        let ptr = unsafe { raw::libssh2_sftp_init(session.ptr) };
        (!ptr.is_null()).then_some(RawSftp { ptr })
    }

    fn sftp_last_error(&self, sftp: &RawSftp) -> u32 {
        // SAFETY: sftp.ptr is live.
        unsafe { raw::libssh2_sftp_last_error(sftp.ptr) as u32 }
    }

    fn sftp_shutdown(&self, sftp: &mut RawSftp) -> i32 {
        if sftp.ptr.is_null() {
            return 0;
        }
        // SAFETY: sftp.ptr is live and nulled right after so it is released once.
        let rc = unsafe { raw::libssh2_sftp_shutdown(sftp.ptr) };
        sftp.ptr = ptr::null_mut();
        rc
    }

    fn sftp_open(
        &self,
        sftp: &RawSftp,
        path: &CStr,
        flags: OpenFlags,
        mode: FilePermissions,
        kind: OpenKind,
    ) -> Option<RawSftpHandle> {
        let open_type = match kind {
            OpenKind::File => SFTP_OPENFILE,
            OpenKind::Directory => SFTP_OPENDIR,
        };
        // SAFETY: sftp.ptr is live; path is passed with its length.
        let ptr = unsafe {
            raw::libssh2_sftp_open_ex(
                sftp.ptr,
                path.as_ptr(),
                path.to_bytes().len() as c_uint,
                flags.bits() as c_ulong,
                mode.mode() as c_long,
                open_type,
            )
        };
        (!ptr.is_null()).then_some(RawSftpHandle { ptr })
    }

    fn sftp_read(&self, file: &RawSftpHandle, buf: &mut [u8]) -> isize {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        unsafe { raw::libssh2_sftp_read(file.ptr, buf.as_mut_ptr() as *mut c_char, buf.len() as _) as isize }
    }

    fn sftp_write(&self, file: &RawSftpHandle, buf: &[u8]) -> isize {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        unsafe { raw::libssh2_sftp_write(file.ptr, buf.as_ptr() as *const c_char, buf.len() as _) as isize }
    }

    fn sftp_readdir(&self, dir: &RawSftpHandle, name: &mut [u8], attrs: &mut FileAttributes) -> isize {
        let mut raw_attrs = zeroed_attributes();
        // SAFETY: name is valid for writes of name.len() bytes; no long entry requested.
        let rc = unsafe {
            raw::libssh2_sftp_readdir_ex(
                dir.ptr,
                name.as_mut_ptr() as *mut c_char,
                name.len() as _,
                ptr::null_mut(),
                0,
                &mut raw_attrs,
            )
        };
        if rc > 0 {
            *attrs = attributes_from_raw(&raw_attrs);
        }
        rc as isize
    }

    fn sftp_fstat(&self, file: &RawSftpHandle, attrs: &mut FileAttributes) -> i32 {
        let mut raw_attrs = zeroed_attributes();
        // SAFETY: file.ptr is live and raw_attrs is a valid out pointer.
        let rc = unsafe { raw::libssh2_sftp_fstat_ex(file.ptr, &mut raw_attrs, SFTP_FSTAT_GET) };
        if rc == 0 {
            *attrs = attributes_from_raw(&raw_attrs);
        }
        rc
    }

    fn sftp_stat(&self, sftp: &RawSftp, path: &CStr, attrs: &mut FileAttributes) -> i32 {
        let mut raw_attrs = zeroed_attributes();
        // SAFETY: sftp.ptr is live; path is passed with its length.
        let rc = unsafe {
            raw::libssh2_sftp_stat_ex(
                sftp.ptr,
                path.as_ptr(),
                path.to_bytes().len() as c_uint,
                SFTP_STAT,
                &mut raw_attrs,
            )
        };
        if rc == 0 {
            *attrs = attributes_from_raw(&raw_attrs);
        }
        rc
    }

    fn sftp_mkdir(&self, sftp: &RawSftp, path: &CStr, mode: FilePermissions) -> i32 {
        // SAFETY: sftp.ptr is live; path is passed with its length.
        unsafe {
            raw::libssh2_sftp_mkdir_ex(
                sftp.ptr,
                path.as_ptr(),
                path.to_bytes().len() as c_uint,
                mode.mode() as c_long,
            )
        }
    }

    fn sftp_rmdir(&self, sftp: &RawSftp, path: &CStr) -> i32 {
        // SAFETY: sftp.ptr is live; path is passed with its length.
        unsafe { raw::libssh2_sftp_rmdir_ex(sftp.ptr, path.as_ptr(), path.to_bytes().len() as c_uint) }
    }

    fn sftp_unlink(&self, sftp: &RawSftp, path: &CStr) -> i32 {
        // SAFETY: sftp.ptr is live; path is passed with its length.
        unsafe { raw::libssh2_sftp_unlink_ex(sftp.ptr, path.as_ptr(), path.to_bytes().len() as c_uint) }
    }

    fn sftp_close_handle(&self, file: &mut RawSftpHandle) -> i32 {
        if file.ptr.is_null() {
            return 0;
        }
        // SAFETY: file.ptr is live and nulled right after so it is closed once.
        let rc = unsafe { raw::libssh2_sftp_close_handle(file.ptr) };
        file.ptr = ptr::null_mut();
        rc
    }
}

impl RawSession {
    /// Whether the native session has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.ptr.is_null()
    }
}
