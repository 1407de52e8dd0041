//! Turning a plugin path into a table of callbacks.

use crate::dispatch::Phase;
use crate::handle::SpankHandle;
use crate::option::SpankOption;
use crate::sys::{
    self, spank_f, spank_option, spank_t, PLUGIN_NAME_SYM, SPANK_INIT_FAILURE_MODE_SYM,
    SPANK_OPTIONS_SYM,
};
use crate::SpankError;
use libloading::{Library, Symbol};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// A plugin callback. Receives the handle and the arguments given on the
/// plugin's `plugstack.conf` line.
pub type SpankFn = Arc<dyn Fn(&mut SpankHandle<'_>, &[String]) -> c_int + Send + Sync>;

/// The callbacks a plugin provides, one optional slot per [`Phase`].
#[derive(Clone, Default)]
pub struct Operations {
    entries: [Option<SpankFn>; Phase::COUNT],
    init_failure_mode: Option<c_int>,
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, phase: Phase, f: F) -> Self
    where
        F: Fn(&mut SpankHandle<'_>, &[String]) -> c_int + Send + Sync + 'static,
    {
        self.set(phase, Arc::new(f));
        self
    }

    pub fn set(&mut self, phase: Phase, f: SpankFn) {
        self.entries[phase.index()] = Some(f);
    }

    /// Status reported instead of the actual one when `init` fails.
    pub fn with_init_failure_mode(mut self, rc: c_int) -> Self {
        self.init_failure_mode = Some(rc);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<&SpankFn> {
        self.entries[phase.index()].as_ref()
    }

    pub fn has(&self, phase: Phase) -> bool {
        self.entries[phase.index()].is_some()
    }

    pub fn init_failure_mode(&self) -> Option<c_int> {
        self.init_failure_mode
    }

    /// Number of symbols provided, the failure mode included.
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
            + self.init_failure_mode.map_or(0, |_| 1)
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phases: Vec<_> = Phase::ALL.iter().filter(|p| self.has(**p)).collect();
        f.debug_struct("Operations")
            .field("phases", &phases)
            .field("init_failure_mode", &self.init_failure_mode)
            .finish()
    }
}

/// A loaded plugin, before it is attached to a stack.
#[derive(Clone)]
pub struct Module {
    name: String,
    ops: Operations,
    options: Vec<SpankOption>,
    // Declared last: the callbacks above point into the library
    library: Option<Arc<Library>>,
}

impl Module {
    pub fn new(name: &str, ops: Operations) -> Self {
        Module {
            name: name.to_string(),
            ops,
            options: Vec::new(),
            library: None,
        }
    }

    /// Options from the plugin's static table.
    pub fn with_options(mut self, options: Vec<SpankOption>) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn ops(&self) -> &Operations {
        &self.ops
    }
    pub fn options(&self) -> &[SpankOption] {
        &self.options
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("ops", &self.ops)
            .field("options", &self.options)
            .field("shared", &self.library.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("spank: {}: {source}", .path.display())]
    Library {
        path: PathBuf,
        source: libloading::Error,
    },
    #[error("spank: {}: no plugin_name symbol", .path.display())]
    MissingName { path: PathBuf },
    #[error("spank: \"{}\" exports 0 symbols", .path.display())]
    NoSymbols { path: PathBuf },
    #[error("spank: {}: invalid option table: {source}", .path.display())]
    OptionTable { path: PathBuf, source: SpankError },
    #[error("spank: {}: no such plugin", .path.display())]
    NotFound { path: PathBuf },
    #[error("spank: {}: argument \"{arg}\" contains a NUL byte", .path.display())]
    InvalidArgument { path: PathBuf, arg: String },
}

/// Source of plugin modules.
pub trait PluginLoader {
    /// Whether `path` names a loadable plugin, used when searching the
    /// plugin directory.
    fn probe(&self, path: &Path) -> bool;
    fn load(&self, path: &Path) -> Result<Module, ModuleError>;
}

/// Loads shared objects exporting the C plugin interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlLoader;

impl DlLoader {
    unsafe fn symbol<'l, T>(lib: &'l Library, name: &str) -> Option<Symbol<'l, T>> {
        lib.get::<T>(name.as_bytes()).ok()
    }

    unsafe fn read_options(lib: &Library, path: &Path) -> Result<Vec<SpankOption>, ModuleError> {
        let mut options = Vec::new();
        let table = match Self::symbol::<*const spank_option>(lib, SPANK_OPTIONS_SYM) {
            Some(table) => *table,
            None => return Ok(options),
        };

        let mut entry = table;
        while !entry.is_null() && !(*entry).name.is_null() {
            let opt = sys::option_from_raw(&*entry).map_err(|source| ModuleError::OptionTable {
                path: path.to_path_buf(),
                source,
            })?;
            options.push(opt);
            entry = entry.add(1);
        }
        Ok(options)
    }
}

fn wrap_entry(f: spank_f) -> SpankFn {
    Arc::new(move |handle: &mut SpankHandle<'_>, argv: &[String]| {
        let args = match argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(args) => args,
            Err(e) => {
                error!("spank: plugin argument with a NUL byte: {}", e);
                return u32::from(SpankError::BadArg) as c_int;
            }
        };
        let mut c_argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr() as *mut c_char).collect();
        c_argv.push(ptr::null_mut());

        let spank = handle as *mut SpankHandle<'_> as *mut c_void as spank_t;
        unsafe { f(spank, args.len() as c_int, c_argv.as_mut_ptr()) }
    })
}

impl PluginLoader for DlLoader {
    fn probe(&self, path: &Path) -> bool {
        match unsafe { Library::new(path) } {
            Ok(lib) => unsafe { Self::symbol::<*const c_char>(&lib, PLUGIN_NAME_SYM) }.is_some(),
            Err(_) => false,
        }
    }

    fn load(&self, path: &Path) -> Result<Module, ModuleError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| ModuleError::Library {
            path: path.to_path_buf(),
            source,
        })?;

        let name = unsafe {
            let sym = Self::symbol::<*const c_char>(&lib, PLUGIN_NAME_SYM).ok_or_else(|| {
                ModuleError::MissingName {
                    path: path.to_path_buf(),
                }
            })?;
            CStr::from_ptr(*sym).to_string_lossy().into_owned()
        };

        let mut ops = Operations::new();
        for phase in Phase::ALL {
            if let Some(sym) = unsafe { Self::symbol::<spank_f>(&lib, phase.symbol()) } {
                ops.set(phase, wrap_entry(*sym));
            }
        }
        if let Some(mode) = unsafe { Self::symbol::<*const c_int>(&lib, SPANK_INIT_FAILURE_MODE_SYM) } {
            ops.init_failure_mode = Some(unsafe { **mode });
        }

        let options = unsafe { Self::read_options(&lib, path) }?;
        debug!(
            "spank: {}: plugin {} exports {} symbols",
            path.display(),
            name,
            ops.count()
        );

        Ok(Module {
            name,
            ops,
            options,
            library: Some(Arc::new(lib)),
        })
    }
}

/// Serves modules built in Rust, keyed by the path they are listed under.
#[derive(Debug, Default, Clone)]
pub struct StaticLoader {
    modules: HashMap<PathBuf, Module>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module<P: Into<PathBuf>>(mut self, path: P, module: Module) -> Self {
        self.insert(path, module);
        self
    }

    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, module: Module) {
        self.modules.insert(path.into(), module);
    }
}

impl PluginLoader for StaticLoader {
    fn probe(&self, path: &Path) -> bool {
        self.modules.contains_key(path)
    }

    fn load(&self, path: &Path) -> Result<Module, ModuleError> {
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound {
                path: path.to_path_buf(),
            })
    }
}
