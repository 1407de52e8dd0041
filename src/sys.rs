//! C ABI shared with native plugins.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]

use crate::option::{OptionCallback, SpankOption};
use crate::SpankError;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

/// Opaque handle passed to every plugin callback.
pub type spank_t = *mut c_void;

/// Plugin entry point: `slurm_spank_<phase>(spank, ac, argv)`.
pub type spank_f =
    unsafe extern "C" fn(spank: spank_t, ac: c_int, argv: *mut *mut c_char) -> c_int;

pub type spank_opt_cb_f =
    Option<unsafe extern "C" fn(val: c_int, optarg: *const c_char, remote: c_int) -> c_int>;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct spank_option {
    pub name: *const c_char,
    pub arginfo: *const c_char,
    pub usage: *const c_char,
    pub has_arg: c_int,
    pub val: c_int,
    pub cb: spank_opt_cb_f,
}

/// Longest option name a plugin may declare.
pub const SPANK_OPTION_MAXLEN: usize = 75;

/// Prefix of the variables carrying option values to the remote side.
pub const SPANK_OPTION_ENV_PREFIX: &str = "_SLURM_SPANK_OPTION_";

pub const SPANK_INIT_FAILURE_MODE_SYM: &str = "slurm_spank_init_failure_mode";
pub const SPANK_OPTIONS_SYM: &str = "spank_options";
pub const PLUGIN_NAME_SYM: &str = "plugin_name";

/// Every symbol the stack resolves from a plugin, in resolution order.
pub const SPANK_SYMS: [&str; 13] = [
    "slurm_spank_init",
    SPANK_INIT_FAILURE_MODE_SYM,
    "slurm_spank_job_prolog",
    "slurm_spank_init_post_opt",
    "slurm_spank_local_user_init",
    "slurm_spank_user_init",
    "slurm_spank_task_init_privileged",
    "slurm_spank_task_init",
    "slurm_spank_task_post_fork",
    "slurm_spank_task_exit",
    "slurm_spank_job_epilog",
    "slurm_spank_slurmd_exit",
    "slurm_spank_exit",
];

unsafe fn opt_str(s: *const c_char) -> Result<Option<String>, SpankError> {
    if s.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(s)
        .to_str()
        .map(|s| Some(s.to_string()))
        .or(Err(SpankError::BadArg))
}

/// Copies a C option declaration out of plugin memory.
///
/// `has_arg` follows getopt: 0 for a flag, 1 for a required argument and 2
/// for an optional one. Getopt tables built from the registry only know
/// flags and options taking a value, so 2 is read as 1: the option takes a
/// value and its argument must be given.
///
/// # Safety
/// Every non-null string in `raw` must be NUL terminated and `raw.cb`, when
/// set, must stay callable for as long as the returned option is used.
pub unsafe fn option_from_raw(raw: &spank_option) -> Result<SpankOption, SpankError> {
    let name = opt_str(raw.name)?.ok_or(SpankError::BadArg)?;

    let mut opt = SpankOption::new(&name).val(raw.val);
    if let Some(usage) = opt_str(raw.usage)? {
        opt = opt.usage(&usage);
    }
    if raw.has_arg != 0 {
        opt = opt.takes_value(&opt_str(raw.arginfo)?.unwrap_or_default());
    }
    if let Some(cb) = raw.cb {
        opt = opt.with_callback(wrap_option_callback(cb));
    }
    Ok(opt)
}

fn wrap_option_callback(
    cb: unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int,
) -> OptionCallback {
    Arc::new(move |val: c_int, optarg: Option<&str>, remote: bool| {
        let optarg = match optarg.map(CString::new).transpose() {
            Ok(optarg) => optarg,
            Err(_) => return u32::from(SpankError::BadArg) as c_int,
        };
        let arg_ptr = optarg.as_ref().map_or(ptr::null(), |a| a.as_ptr());
        unsafe { cb(val, arg_ptr, remote as c_int) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn echo_len(val: c_int, optarg: *const c_char, remote: c_int) -> c_int {
        let len = if optarg.is_null() {
            0
        } else {
            CStr::from_ptr(optarg).to_bytes().len() as c_int
        };
        val * 100 + len * 10 + remote
    }

    #[test]
    fn raw_options_are_copied() {
        let raw = spank_option {
            name: b"renice\0".as_ptr() as *const c_char,
            arginfo: b"prio\0".as_ptr() as *const c_char,
            usage: b"Re-nice job tasks\0".as_ptr() as *const c_char,
            has_arg: 1,
            val: 3,
            cb: Some(echo_len),
        };

        let opt = unsafe { option_from_raw(&raw) }.unwrap();
        assert_eq!(opt.name(), "renice");
        assert_eq!(opt.arginfo(), Some("prio"));
        assert_eq!(opt.usage_text(), Some("Re-nice job tasks"));
        assert!(opt.has_arg());

        let cb = opt.callback_fn().unwrap();
        assert_eq!(cb(3, Some("ab"), true), 321);
        assert_eq!(cb(3, None, false), 300);
    }

    #[test]
    fn optional_arguments_take_a_value() {
        let raw = |has_arg| spank_option {
            name: b"level\0".as_ptr() as *const c_char,
            arginfo: ptr::null(),
            usage: ptr::null(),
            has_arg,
            val: 0,
            cb: None,
        };

        assert!(!unsafe { option_from_raw(&raw(0)) }.unwrap().has_arg());
        let optional = unsafe { option_from_raw(&raw(2)) }.unwrap();
        assert!(optional.has_arg());
        assert_eq!(optional.arginfo(), Some(""));
    }

    #[test]
    fn raw_option_without_name_is_rejected() {
        let raw = spank_option {
            name: ptr::null(),
            arginfo: ptr::null(),
            usage: ptr::null(),
            has_arg: 0,
            val: 0,
            cb: None,
        };
        assert_eq!(
            unsafe { option_from_raw(&raw) }.unwrap_err(),
            SpankError::BadArg
        );
    }
}
