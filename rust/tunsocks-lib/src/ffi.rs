//! C ABI over [`api`](crate::api) for hosts loading the cdylib

use crate::api;
use crate::error::codes;
use libc::{c_char, c_int, size_t};
use std::ffi::CStr;
use tunsocks_stack::EngineConfig;

/// Read an optional C string; `Err` on invalid UTF-8
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn opt_str(ptr: *const c_char) -> Result<Option<String>, ()> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr).to_str().map(|s| Some(s.to_string())).map_err(|_| ())
}

/// Start the engine with the most common settings; 0 or a negative code.
///
/// # Safety
/// `proxy_host` must be a valid NUL-terminated string. `username` and
/// `password` may be null (no authentication) or valid strings.
#[no_mangle]
pub unsafe extern "C" fn tunsocks_start(
    tun_fd: c_int,
    proxy_host: *const c_char,
    proxy_port: u16,
    username: *const c_char,
    password: *const c_char,
    mtu: u16,
) -> c_int {
    let (Ok(Some(host)), Ok(username), Ok(password)) =
        (opt_str(proxy_host), opt_str(username), opt_str(password))
    else {
        return codes::INVALID_CONFIG;
    };

    let mut builder = EngineConfig::builder().proxy(host, proxy_port).mtu(mtu);
    if let (Some(username), Some(password)) = (username, password) {
        builder = builder.auth(username, password);
    }
    api::start(tun_fd, builder.build())
}

#[no_mangle]
pub extern "C" fn tunsocks_stop() {
    api::stop();
}

#[no_mangle]
pub extern "C" fn tunsocks_is_running() -> c_int {
    api::is_running() as c_int
}

/// Copy the status report into `buf` (NUL-terminated, truncated to fit).
/// Returns the full report length in bytes.
///
/// # Safety
/// `buf` must be null or valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn tunsocks_status(buf: *mut c_char, len: size_t) -> size_t {
    copy_out(&api::status_report(), buf, len)
}

/// Copy the last error into `buf`; returns 0 (and writes nothing) when
/// there is none.
///
/// # Safety
/// `buf` must be null or valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn tunsocks_last_error(buf: *mut c_char, len: size_t) -> size_t {
    match api::last_error() {
        Some(err) => copy_out(&err, buf, len),
        None => 0,
    }
}

/// # Safety
/// `buf` must be null or valid for `len` bytes of writes.
unsafe fn copy_out(text: &str, buf: *mut c_char, len: size_t) -> size_t {
    if !buf.is_null() && len > 0 {
        let n = text.len().min(len - 1);
        std::ptr::copy_nonoverlapping(text.as_ptr() as *const c_char, buf, n);
        *buf.add(n) = 0;
    }
    text.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_out_truncates_and_terminates() {
        let mut buf = [0x7f as c_char; 6];
        let full = unsafe { copy_out("running", buf.as_mut_ptr(), buf.len()) };
        assert_eq!(full, 7);
        let text = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(text.to_str().unwrap(), "runni");

        assert_eq!(unsafe { copy_out("x", std::ptr::null_mut(), 0) }, 1);
    }

    #[test]
    fn null_host_is_invalid_config() {
        let code = unsafe {
            tunsocks_start(3, std::ptr::null(), 1080, std::ptr::null(), std::ptr::null(), 1500)
        };
        assert_eq!(code, codes::INVALID_CONFIG);
    }
}
