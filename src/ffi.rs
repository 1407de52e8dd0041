//! Functions native plugins link against.
//!
//! The `spank_t` handed to a native callback points to the [`SpankHandle`]
//! of the call, so every export below forwards to the Rust API.

use crate::handle::SpankHandle;
use crate::runtime;
use crate::sys::{self, spank_option, spank_t};
use crate::SpankError;
use byte_strings::concat_bytes;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

fn status(result: Result<(), SpankError>) -> c_int {
    SpankError::status(result) as c_int
}

unsafe fn with_handle<R>(
    spank: spank_t,
    f: impl FnOnce(&mut SpankHandle<'_>) -> Result<R, SpankError>,
) -> Result<R, SpankError> {
    let handle = (spank as *mut SpankHandle<'static>)
        .as_mut()
        .ok_or(SpankError::BadArg)?;
    f(handle)
}

unsafe fn c_str<'a>(s: *const c_char) -> Result<&'a str, SpankError> {
    if s.is_null() {
        return Err(SpankError::BadArg);
    }
    CStr::from_ptr(s).to_str().or(Err(SpankError::BadArg))
}

/// Copies `value` into `buf` the way strlcpy does, failing when it does not
/// fit.
unsafe fn copy_out(value: &str, buf: *mut c_char, len: c_int) -> Result<(), SpankError> {
    let len = len as usize;
    let n = value.len().min(len - 1);
    ptr::copy_nonoverlapping(value.as_ptr() as *const c_char, buf, n);
    *buf.add(n) = 0;
    if value.len() >= len {
        return Err(SpankError::NoSpace);
    }
    Ok(())
}

fn check_buffer(buf: *mut c_char, len: c_int) -> Result<(), SpankError> {
    if buf.is_null() || len <= 0 {
        return Err(SpankError::BadArg);
    }
    Ok(())
}

#[no_mangle]
pub unsafe extern "C" fn spank_option_register(spank: spank_t, opt: *mut spank_option) -> c_int {
    status(with_handle(spank, |handle| {
        let opt = opt.as_ref().ok_or(SpankError::BadArg)?;
        handle.register_option(sys::option_from_raw(opt)?)
    }))
}

/// Reads the value of `opt`. `*optarg` is left alone for options without a
/// value and otherwise points into the option registry, valid for the life
/// of the stack.
#[no_mangle]
pub unsafe extern "C" fn spank_option_getopt(
    spank: spank_t,
    opt: *mut spank_option,
    optarg: *mut *mut c_char,
) -> c_int {
    status(with_handle(spank, |handle| {
        let opt = sys::option_from_raw(opt.as_ref().ok_or(SpankError::BadArg)?)?;
        if let Some(value) = handle.getopt_c(&opt)? {
            if !optarg.is_null() {
                *optarg = value.as_ptr() as *mut c_char;
            }
        }
        Ok(())
    }))
}

/// 1 in slurmstepd, 0 elsewhere, -1 for an invalid handle.
#[no_mangle]
pub unsafe extern "C" fn spank_remote(spank: spank_t) -> c_int {
    with_handle(spank, |handle| Ok(handle.remote() as c_int)).unwrap_or(-1)
}

/// Context of the running stack, 0 when there is none.
#[no_mangle]
pub extern "C" fn spank_context() -> c_int {
    runtime::current_context().map_or(0, |c| u32::from(c) as c_int)
}

#[no_mangle]
pub unsafe extern "C" fn spank_symbol_supported(name: *const c_char) -> c_int {
    match c_str(name) {
        Ok(name) => runtime::symbol_supported(name) as c_int,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn spank_strerror(err: c_int) -> *const c_char {
    let msg: &'static [u8] = match err {
        0 => concat_bytes!(b"Success", b"\0"),
        err => match SpankError::try_from(err as u32) {
            Ok(err) => err.message(),
            Err(_) => concat_bytes!(b"Unknown error", b"\0"),
        },
    };
    msg.as_ptr() as *const c_char
}

#[no_mangle]
pub unsafe extern "C" fn spank_getenv(
    spank: spank_t,
    var: *const c_char,
    buf: *mut c_char,
    len: c_int,
) -> c_int {
    status(with_handle(spank, |handle| {
        if !handle.remote() {
            return Err(SpankError::NotRemote);
        }
        check_buffer(buf, len)?;
        let value = handle.getenv(c_str(var)?)?.ok_or(SpankError::EnvNotExist)?;
        copy_out(&value, buf, len)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn spank_setenv(
    spank: spank_t,
    var: *const c_char,
    val: *const c_char,
    overwrite: c_int,
) -> c_int {
    status(with_handle(spank, |handle| {
        handle.setenv(c_str(var)?, c_str(val)?, overwrite != 0)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn spank_unsetenv(spank: spank_t, var: *const c_char) -> c_int {
    status(with_handle(spank, |handle| handle.unsetenv(c_str(var)?)))
}

#[no_mangle]
pub unsafe extern "C" fn spank_job_control_getenv(
    spank: spank_t,
    var: *const c_char,
    buf: *mut c_char,
    len: c_int,
) -> c_int {
    status(with_handle(spank, |handle| {
        check_buffer(buf, len)?;
        let value = handle
            .job_control_getenv(c_str(var)?)?
            .ok_or(SpankError::EnvNotExist)?;
        copy_out(&value, buf, len)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn spank_job_control_setenv(
    spank: spank_t,
    var: *const c_char,
    val: *const c_char,
    overwrite: c_int,
) -> c_int {
    status(with_handle(spank, |handle| {
        handle.job_control_setenv(c_str(var)?, c_str(val)?, overwrite != 0)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn spank_job_control_unsetenv(spank: spank_t, var: *const c_char) -> c_int {
    status(with_handle(spank, |handle| {
        handle.job_control_unsetenv(c_str(var)?)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn spank_prepend_task_argv(
    spank: spank_t,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    status(with_handle(spank, |handle| {
        if argv.is_null() || argc < 0 {
            return Err(SpankError::BadArg);
        }
        let args = (0..argc as usize)
            .map(|i| c_str(*argv.add(i)))
            .collect::<Result<Vec<_>, _>>()?;
        handle.prepend_task_argv(&args)
    }))
}
