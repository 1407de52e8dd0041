//! Environment blocks and the job-control environment hook.

use lazy_static::lazy_static;
use libloading::os::unix::{Library, Symbol};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use thiserror::Error;

/// Something holding `NAME=VALUE` variables.
pub trait Environ {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&mut self, name: &str, value: &str);
    fn unset(&mut self, name: &str);
}

/// Value of `name` in a `NAME=VALUE` block.
pub fn getenvp<'a>(env: &'a [String], name: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        entry
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// Sets `name` in a block. Returns false when the variable exists and
/// `overwrite` is not set.
pub fn setenvp(env: &mut Vec<String>, name: &str, value: &str, overwrite: bool) -> bool {
    let entry = format!("{}={}", name, value);
    let prefix = format!("{}=", name);
    match env.iter_mut().find(|e| e.starts_with(&prefix)) {
        Some(_) if !overwrite => false,
        Some(existing) => {
            *existing = entry;
            true
        }
        None => {
            env.push(entry);
            true
        }
    }
}

pub fn unsetenvp(env: &mut Vec<String>, name: &str) {
    let prefix = format!("{}=", name);
    env.retain(|e| !e.starts_with(&prefix));
}

impl Environ for Vec<String> {
    fn get(&self, name: &str) -> Option<String> {
        getenvp(self, name).map(str::to_string)
    }
    fn set(&mut self, name: &str, value: &str) {
        setenvp(self, name, value, true);
    }
    fn unset(&mut self, name: &str) {
        unsetenvp(self, name);
    }
}

/// The environment of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl Environ for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
    fn set(&mut self, name: &str, value: &str) {
        std::env::set_var(name, value);
    }
    fn unset(&mut self, name: &str) {
        std::env::remove_var(name);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobEnvError {
    #[error("job environment hook {0} is not available")]
    Unavailable(&'static str),
    #[error("job environment hook rejected {name} (rc={rc})")]
    Rejected { name: String, rc: c_int },
}

/// Access to the job environment kept by the job control layer of the
/// launcher (the `spank_job_env` of srun/sbatch/salloc).
pub trait JobEnv: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    /// `value` may be absent, in which case the hook decides how to record it.
    fn set(&self, name: &str, value: Option<&str>, overwrite: bool) -> Result<(), JobEnvError>;
    fn unset(&self, name: &str) -> Result<(), JobEnvError>;
}

/// Hook used when the host provides no job control layer. Updates are
/// accepted and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJobEnv;

impl JobEnv for NoJobEnv {
    fn get(&self, _name: &str) -> Option<String> {
        None
    }
    fn set(&self, _name: &str, _value: Option<&str>, _overwrite: bool) -> Result<(), JobEnvError> {
        Ok(())
    }
    fn unset(&self, _name: &str) -> Result<(), JobEnvError> {
        Ok(())
    }
}

type GetJobEnvFn = unsafe extern "C" fn(name: *const c_char) -> *const c_char;
type SetJobEnvFn =
    unsafe extern "C" fn(name: *const c_char, value: *const c_char, overwrite: c_int) -> c_int;
type UnsetJobEnvFn = unsafe extern "C" fn(name: *const c_char) -> c_int;

lazy_static! {
    // Never closed: the hooks live in the main program image
    static ref PROCESS_IMAGE: Library = Library::this();
}

/// Resolves `spank_get_job_env`, `spank_set_job_env` and
/// `spank_unset_job_env` from the running program on every call, so that
/// the launcher does not need to link against this crate to provide them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessImageJobEnv;

impl ProcessImageJobEnv {
    fn resolve<T>(name: &'static str) -> Result<Symbol<T>, JobEnvError> {
        unsafe { PROCESS_IMAGE.get::<T>(name.as_bytes()) }.or(Err(JobEnvError::Unavailable(name)))
    }
}

fn c_string(s: &str) -> Result<CString, JobEnvError> {
    CString::new(s).or(Err(JobEnvError::Rejected {
        name: s.to_string(),
        rc: -1,
    }))
}

impl JobEnv for ProcessImageJobEnv {
    fn get(&self, name: &str) -> Option<String> {
        let get = Self::resolve::<GetJobEnvFn>("spank_get_job_env").ok()?;
        let name = CString::new(name).ok()?;
        let value = unsafe { get(name.as_ptr()) };
        if value.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(value) }
            .to_str()
            .ok()
            .map(str::to_string)
    }

    fn set(&self, name: &str, value: Option<&str>, overwrite: bool) -> Result<(), JobEnvError> {
        let set = Self::resolve::<SetJobEnvFn>("spank_set_job_env")?;
        let c_name = c_string(name)?;
        let c_value = value.map(c_string).transpose()?;
        let value_ptr = c_value.as_ref().map_or(ptr::null(), |v| v.as_ptr());

        match unsafe { set(c_name.as_ptr(), value_ptr, overwrite as c_int) } {
            rc if rc < 0 => Err(JobEnvError::Rejected {
                name: name.to_string(),
                rc,
            }),
            _ => Ok(()),
        }
    }

    fn unset(&self, name: &str) -> Result<(), JobEnvError> {
        let unset = Self::resolve::<UnsetJobEnvFn>("spank_unset_job_env")?;
        let c_name = c_string(name)?;
        match unsafe { unset(c_name.as_ptr()) } {
            rc if rc < 0 => Err(JobEnvError::Rejected {
                name: name.to_string(),
                rc,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<String> {
        vec!["PATH=/bin".to_string(), "PATHS=x".to_string(), "EMPTY=".to_string()]
    }

    #[test]
    fn lookups_match_whole_names() {
        let env = block();
        assert_eq!(getenvp(&env, "PATH"), Some("/bin"));
        assert_eq!(getenvp(&env, "PATHS"), Some("x"));
        assert_eq!(getenvp(&env, "EMPTY"), Some(""));
        assert_eq!(getenvp(&env, "PAT"), None);
    }

    #[test]
    fn set_respects_overwrite() {
        let mut env = block();
        assert!(!setenvp(&mut env, "PATH", "/usr/bin", false));
        assert_eq!(getenvp(&env, "PATH"), Some("/bin"));
        assert!(setenvp(&mut env, "PATH", "/usr/bin", true));
        assert_eq!(getenvp(&env, "PATH"), Some("/usr/bin"));
        assert!(setenvp(&mut env, "NEW", "1", false));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn unset_leaves_similar_names() {
        let mut env = block();
        unsetenvp(&mut env, "PATH");
        assert_eq!(env, vec!["PATHS=x".to_string(), "EMPTY=".to_string()]);
    }

    #[test]
    fn missing_job_control_accepts_updates() {
        assert_eq!(NoJobEnv.set("ANYTHING", Some("1"), true), Ok(()));
        assert_eq!(NoJobEnv.set("ANYTHING", None, false), Ok(()));
        assert_eq!(NoJobEnv.unset("ANYTHING"), Ok(()));
        assert_eq!(NoJobEnv.get("ANYTHING"), None);
    }

    #[test]
    fn process_image_without_hooks_is_unavailable() {
        let hook = ProcessImageJobEnv;
        assert_eq!(hook.get("ANYTHING"), None);
        assert_eq!(
            hook.set("ANYTHING", Some("1"), true),
            Err(JobEnvError::Unavailable("spank_set_job_env"))
        );
        assert_eq!(
            hook.unset("ANYTHING"),
            Err(JobEnvError::Unavailable("spank_unset_job_env"))
        );
    }
}
