//! Building a plugin stack from its configuration file.

use crate::dispatch::Phase;
use crate::environ::{JobEnv, NoJobEnv};
use crate::loader::{Module, ModuleError, Operations, PluginLoader};
use crate::option::OptionRegistry;
use crate::plugstack::{parse_line, Directive, DirectiveKind};
use crate::Context;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

static HAS_PROLOG: AtomicBool = AtomicBool::new(false);
static HAS_EPILOG: AtomicBool = AtomicBool::new(false);
static HAS_USER_INIT: AtomicBool = AtomicBool::new(false);
static HAS_TASK_POST_FORK: AtomicBool = AtomicBool::new(false);
static HAS_TASK_EXIT: AtomicBool = AtomicBool::new(false);

/// Whether any plugin seen by slurmd provides a job prolog.
pub fn has_prolog() -> bool {
    HAS_PROLOG.load(Ordering::Relaxed)
}
pub fn has_epilog() -> bool {
    HAS_EPILOG.load(Ordering::Relaxed)
}
pub fn has_user_init() -> bool {
    HAS_USER_INIT.load(Ordering::Relaxed)
}
pub fn has_task_post_fork() -> bool {
    HAS_TASK_POST_FORK.load(Ordering::Relaxed)
}
pub fn has_task_exit() -> bool {
    HAS_TASK_EXIT.load(Ordering::Relaxed)
}

fn flag_if(flag: &AtomicBool, set: bool) {
    if set {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Decides whether a plugin has anything to do in `kind`, recording
/// process-wide which callbacks exist along the way.
fn valid_for_context(kind: Context, ops: &Operations) -> bool {
    match kind {
        Context::JobScript => ops.has(Phase::JobProlog) || ops.has(Phase::JobEpilog),
        Context::Slurmd => {
            // slurmd decides from these whether to run a job-script stack
            flag_if(&HAS_PROLOG, ops.has(Phase::JobProlog));
            flag_if(&HAS_EPILOG, ops.has(Phase::JobEpilog));
            ops.has(Phase::Init) || ops.has(Phase::SlurmdExit)
        }
        Context::Local | Context::Allocator | Context::Remote => {
            flag_if(&HAS_USER_INIT, ops.has(Phase::StepUserInit));
            flag_if(&HAS_TASK_POST_FORK, ops.has(Phase::StepTaskPostFork));
            flag_if(&HAS_TASK_EXIT, ops.has(Phase::StepTaskExit));
            true
        }
    }
}

/// A plugin attached to a stack.
#[derive(Debug)]
pub struct Plugin {
    fq_path: PathBuf,
    required: bool,
    argv: Arc<[String]>,
    module: Module,
}

impl Plugin {
    pub(crate) fn new(fq_path: PathBuf, required: bool, argv: Vec<String>, module: Module) -> Self {
        Plugin {
            fq_path,
            required,
            argv: argv.into(),
            module,
        }
    }

    /// Name the plugin declares for itself.
    pub fn name(&self) -> &str {
        self.module.name()
    }
    pub fn fq_path(&self) -> &Path {
        &self.fq_path
    }
    /// File name of the plugin, used in diagnostics.
    pub fn basename(&self) -> String {
        self.fq_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.fq_path.display().to_string())
    }
    pub fn required(&self) -> bool {
        self.required
    }
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
    pub(crate) fn argv_shared(&self) -> Arc<[String]> {
        self.argv.clone()
    }
    pub fn ops(&self) -> &Operations {
        self.module.ops()
    }
}

/// The plugins loaded for one context, in load order, and the options they
/// registered.
pub struct Stack {
    kind: Context,
    plugins: Vec<Plugin>,
    options: OptionRegistry,
    plugin_path: String,
    job_env: Arc<dyn JobEnv>,
}

impl Stack {
    /// A stack with no plugins.
    pub fn empty(kind: Context) -> Self {
        Stack {
            kind,
            plugins: Vec::new(),
            options: OptionRegistry::new(),
            plugin_path: String::new(),
            job_env: Arc::new(NoJobEnv),
        }
    }

    pub fn with_job_env(mut self, job_env: Arc<dyn JobEnv>) -> Self {
        self.job_env = job_env;
        self
    }

    pub fn kind(&self) -> Context {
        self.kind
    }
    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }
    pub fn options(&self) -> &OptionRegistry {
        &self.options
    }
    pub fn options_mut(&mut self) -> &mut OptionRegistry {
        &mut self.options
    }
    pub fn plugin_path(&self) -> &str {
        &self.plugin_path
    }
    pub fn job_env(&self) -> &dyn JobEnv {
        &*self.job_env
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Appends a loaded plugin and registers the options of its static
    /// table.
    pub(crate) fn push(&mut self, plugin: Plugin) {
        // The static option table is not consulted for sbatch/salloc
        let options = match self.kind {
            Context::Allocator => Vec::new(),
            _ => plugin.module.options().to_vec(),
        };
        let index = self.plugins.len();
        let name = plugin.name().to_string();
        self.plugins.push(plugin);

        for opt in &options {
            // Rejections are logged by the registry
            let _ = self.options.register(index, &name, opt);
        }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("kind", &self.kind)
            .field("plugins", &self.plugins)
            .field("options", &self.options)
            .field("plugin_path", &self.plugin_path)
            .finish()
    }
}

/// Drops the comment of a raw configuration line and decodes the rest.
/// Bytes that are not UTF-8 become U+FFFD, so a plugin path holding them
/// fails to load instead of the whole file being rejected.
fn decode_line(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == b'#').unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Plugin arguments travel as C strings, so none may hold a NUL.
fn check_args(path: &Path, args: &[String]) -> Result<(), ModuleError> {
    match args.iter().find(|a| a.contains('\0')) {
        Some(arg) => Err(ModuleError::InvalidArgument {
            path: path.to_path_buf(),
            arg: arg.escape_default().to_string(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("spank: failed to open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("{}: {line}: invalid include directive", .file.display())]
    InvalidInclude { file: PathBuf, line: usize },
    #[error("spank: {}:{line}: failed to load plugin {}", .file.display(), .path.display())]
    Required {
        file: PathBuf,
        line: usize,
        path: PathBuf,
        source: ModuleError,
    },
}

/// Reads `plugstack.conf` documents into a [`Stack`].
pub struct StackBuilder<'a> {
    loader: &'a dyn PluginLoader,
    plugin_path: String,
    job_env: Arc<dyn JobEnv>,
}

impl<'a> StackBuilder<'a> {
    pub fn new(loader: &'a dyn PluginLoader) -> Self {
        StackBuilder {
            loader,
            plugin_path: String::new(),
            job_env: Arc::new(NoJobEnv),
        }
    }

    /// `:` separated directories searched for plugins given by file name.
    pub fn plugin_path(mut self, path: &str) -> Self {
        self.plugin_path = path.to_string();
        self
    }

    pub fn job_env(mut self, job_env: Arc<dyn JobEnv>) -> Self {
        self.job_env = job_env;
        self
    }

    /// Builds the stack for `kind` described by `conf`. A missing file gives
    /// an empty stack.
    pub fn build(&self, conf: &Path, kind: Context) -> Result<Stack, LoadError> {
        let mut stack = Stack {
            kind,
            plugins: Vec::new(),
            options: OptionRegistry::new(),
            plugin_path: self.plugin_path.clone(),
            job_env: self.job_env.clone(),
        };
        self.load_file(&mut stack, conf)?;
        Ok(stack)
    }

    fn load_file(&self, stack: &mut Stack, path: &Path) -> Result<(), LoadError> {
        debug!("spank: opening plugin stack {}", path.display());

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                error!("spank: Failed to open {}: {}", path.display(), source);
                return Err(LoadError::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        for (idx, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(|source| LoadError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            self.process_line(stack, path, idx + 1, &decode_line(&line))?;
        }
        Ok(())
    }

    fn process_line(
        &self,
        stack: &mut Stack,
        file: &Path,
        line: usize,
        buf: &str,
    ) -> Result<(), LoadError> {
        let directive = match parse_line(buf) {
            Ok(Some(directive)) => directive,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!("spank: {}:{}: Invalid line. Ignoring. ({})", file.display(), line, e);
                return Ok(());
            }
        };

        match directive {
            Directive {
                kind: DirectiveKind::Include,
                path,
                ..
            } => self.include(stack, file, line, path.as_deref()),
            Directive { path: None, .. } => {
                error!("spank: {}:{}: Invalid line. Ignoring.", file.display(), line);
                Ok(())
            }
            Directive {
                kind,
                path: Some(path),
                args,
            } => self.load_plugin(stack, file, line, &path, args, kind == DirectiveKind::Required),
        }
    }

    fn include(
        &self,
        stack: &mut Stack,
        file: &Path,
        line: usize,
        pattern: Option<&str>,
    ) -> Result<(), LoadError> {
        let pattern = match pattern {
            Some(pattern) => pattern,
            None => {
                error!("{}: {}: Invalid include directive", file.display(), line);
                return Err(LoadError::InvalidInclude {
                    file: file.to_path_buf(),
                    line,
                });
            }
        };

        let pattern = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            let dir = file
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            format!("{}/{}", dir.display(), pattern)
        };
        debug!("{}: {}: include \"{}\"", file.display(), line, pattern);

        // A pattern glob cannot parse matches nothing
        let matches = match glob::glob(&pattern) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(
                    "{}: {}: include \"{}\" matches nothing: {}",
                    file.display(),
                    line,
                    pattern,
                    e
                );
                return Ok(());
            }
        };

        for entry in matches {
            match entry {
                Ok(path) => self.load_file(stack, &path)?,
                Err(e) => info!(
                    "{}:{}: cannot read dir {}: {}",
                    file.display(),
                    line,
                    pattern,
                    e
                ),
            }
        }
        Ok(())
    }

    fn find_plugin(&self, file: &str) -> Option<PathBuf> {
        self.plugin_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(file))
            .find(|path| self.loader.probe(path))
    }

    fn load_plugin(
        &self,
        stack: &mut Stack,
        file: &Path,
        line: usize,
        path: &str,
        args: Vec<String>,
        required: bool,
    ) -> Result<(), LoadError> {
        let fq_path = if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            self.find_plugin(path).unwrap_or_else(|| PathBuf::from(path))
        };

        let loaded = check_args(&fq_path, &args)
            .and_then(|()| self.loader.load(&fq_path))
            .and_then(|module| {
                if module.ops().count() == 0 {
                    Err(ModuleError::NoSymbols {
                        path: fq_path.clone(),
                    })
                } else {
                    Ok(module)
                }
            });

        let module = match loaded {
            Ok(module) => module,
            Err(source) => {
                error!("{}", source);
                if !required {
                    info!(
                        "spank: {}:{}: Failed to load optional plugin {}. Ignored.",
                        file.display(),
                        line,
                        fq_path.display()
                    );
                    return Ok(());
                }
                error!(
                    "spank: {}:{}: Failed to load plugin {}. Aborting.",
                    file.display(),
                    line,
                    fq_path.display()
                );
                return Err(LoadError::Required {
                    file: file.to_path_buf(),
                    line,
                    path: fq_path,
                    source,
                });
            }
        };

        if stack.plugins.iter().any(|p| p.fq_path == fq_path) {
            error!(
                "spank: {}: cowardly refusing to load a second time",
                fq_path.display()
            );
            return Ok(());
        }

        if !valid_for_context(stack.kind, module.ops()) {
            trace!("spank: {}: no callbacks in this context", fq_path.display());
            return Ok(());
        }

        let plugin = Plugin::new(fq_path, required, args, module);
        debug!(
            "spank: {}:{}: Loaded plugin {}",
            file.display(),
            line,
            plugin.basename()
        );
        stack.push(plugin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Module, StaticLoader};
    use crate::option::SpankOption;
    use std::io::Write;

    fn module(name: &str, phases: &[Phase]) -> Module {
        let ops = phases
            .iter()
            .fold(Operations::new(), |ops, phase| ops.with(*phase, |_, _| 0));
        Module::new(name, ops)
    }

    fn write_conf(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_file_is_an_empty_stack() {
        let loader = StaticLoader::new();
        let stack = StackBuilder::new(&loader)
            .build(Path::new("/nonexistent/plugstack.conf"), Context::Local)
            .unwrap();
        assert!(stack.plugins().is_empty());
        assert!(stack.options().is_empty());
    }

    #[test]
    fn relative_names_are_searched_in_the_plugin_path() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new()
            .with_module("/opt/b/foo.so", module("foo", &[Phase::Init]))
            .with_module("/opt/c/foo.so", module("other", &[Phase::Init]));
        let conf = write_conf(dir.path(), "plugstack.conf", "required foo.so a b\n");

        let stack = StackBuilder::new(&loader)
            .plugin_path("/opt/a:/opt/b:/opt/c")
            .build(&conf, Context::Remote)
            .unwrap();

        assert_eq!(stack.plugins().len(), 1);
        let plugin = &stack.plugins()[0];
        assert_eq!(plugin.fq_path(), Path::new("/opt/b/foo.so"));
        assert_eq!(plugin.name(), "foo");
        assert_eq!(plugin.argv(), ["a", "b"]);
        assert!(plugin.required());
    }

    #[test]
    fn unresolved_required_plugin_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new();
        let conf = write_conf(dir.path(), "plugstack.conf", "required missing.so\n");

        let err = StackBuilder::new(&loader)
            .plugin_path("/opt/a")
            .build(&conf, Context::Local)
            .unwrap_err();
        match err {
            LoadError::Required { line, path, .. } => {
                assert_eq!(line, 1);
                assert_eq!(path, PathBuf::from("missing.so"));
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn optional_failures_and_bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new()
            .with_module("/lib/empty.so", module("empty", &[]))
            .with_module("/lib/ok.so", module("ok", &[Phase::Exit]));
        let conf = write_conf(
            dir.path(),
            "plugstack.conf",
            "optional /lib/missing.so\n\
             optional /lib/empty.so\n\
             sometimes /lib/ok.so\n\
             required\n\
             # comment\n\
             required /lib/ok.so\n",
        );

        let stack = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap();
        assert_eq!(stack.plugin_names(), vec!["ok"]);
    }

    #[test]
    fn plugins_without_symbols_are_load_failures() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module("/lib/empty.so", module("empty", &[]));
        let conf = write_conf(dir.path(), "plugstack.conf", "required /lib/empty.so\n");

        let err = StackBuilder::new(&loader)
            .build(&conf, Context::Remote)
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Required {
                source: ModuleError::NoSymbols { .. },
                ..
            }
        ));
    }

    #[test]
    fn second_load_of_a_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module("/lib/a.so", module("a", &[Phase::Init]));
        let conf = write_conf(
            dir.path(),
            "plugstack.conf",
            "required /lib/a.so\noptional /lib/a.so\n",
        );

        let stack = StackBuilder::new(&loader)
            .build(&conf, Context::Remote)
            .unwrap();
        assert_eq!(stack.plugins().len(), 1);
    }

    #[test]
    fn job_script_and_slurmd_filter_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new()
            .with_module("/lib/prolog.so", module("prolog", &[Phase::JobProlog]))
            .with_module("/lib/init.so", module("init", &[Phase::Init]))
            .with_module("/lib/task.so", module("task", &[Phase::StepUserTaskInit]));
        let conf = write_conf(
            dir.path(),
            "plugstack.conf",
            "required /lib/prolog.so\nrequired /lib/init.so\nrequired /lib/task.so\n",
        );
        let builder = StackBuilder::new(&loader);

        let script = builder.build(&conf, Context::JobScript).unwrap();
        assert_eq!(script.plugin_names(), vec!["prolog"]);

        let slurmd = builder.build(&conf, Context::Slurmd).unwrap();
        assert_eq!(slurmd.plugin_names(), vec!["init"]);
        assert!(has_prolog());

        let remote = builder.build(&conf, Context::Remote).unwrap();
        assert_eq!(remote.plugin_names(), vec!["prolog", "init", "task"]);
    }

    #[test]
    fn static_options_are_skipped_for_allocators() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module(
            "/lib/opt.so",
            module("opt", &[Phase::Init]).with_options(vec![SpankOption::new("flag")]),
        );
        let conf = write_conf(dir.path(), "plugstack.conf", "required /lib/opt.so\n");
        let builder = StackBuilder::new(&loader);

        let local = builder.build(&conf, Context::Local).unwrap();
        assert_eq!(local.options().len(), 1);
        assert_eq!(local.options().find("opt", "flag").unwrap().plugin(), 0);

        let alloc = builder.build(&conf, Context::Allocator).unwrap();
        assert!(alloc.options().is_empty());
    }

    #[test]
    fn relative_includes_follow_the_including_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf.d")).unwrap();
        let loader = StaticLoader::new()
            .with_module("/lib/a.so", module("a", &[Phase::Init]))
            .with_module("/lib/b.so", module("b", &[Phase::Init]))
            .with_module("/lib/c.so", module("c", &[Phase::Init]));
        write_conf(&dir.path().join("conf.d"), "20-c.conf", "optional /lib/c.so\n");
        write_conf(&dir.path().join("conf.d"), "10-b.conf", "required /lib/b.so\n");
        let conf = write_conf(
            dir.path(),
            "plugstack.conf",
            "required /lib/a.so\ninclude conf.d/*.conf\ninclude nothing/*.conf\n",
        );

        let stack = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap();
        assert_eq!(stack.plugin_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn include_without_pattern_fails() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new();
        let conf = write_conf(dir.path(), "plugstack.conf", "\ninclude\n");

        let err = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidInclude { line: 2, .. }));
    }

    #[test]
    fn latin1_bytes_do_not_spoil_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module("/lib/a.so", module("a", &[Phase::Init]));
        let conf = dir.path().join("plugstack.conf");
        std::fs::write(&conf, b"# caf\xe9 plugin\nrequired /lib/a.so # d\xe9j\xe0\n").unwrap();

        let stack = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap();
        assert_eq!(stack.plugin_names(), vec!["a"]);

        // Outside a comment the bytes reach the path, which does not load
        std::fs::write(&conf, b"required /lib/caf\xe9.so\n").unwrap();
        let err = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap_err();
        assert!(matches!(err, LoadError::Required { line: 1, .. }));
    }

    #[test]
    fn unparsable_include_pattern_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module("/lib/a.so", module("a", &[Phase::Init]));
        let conf = write_conf(
            dir.path(),
            "plugstack.conf",
            "include conf.d/a**b.conf\nrequired /lib/a.so\n",
        );

        let stack = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap();
        assert_eq!(stack.plugin_names(), vec!["a"]);
    }

    #[test]
    fn arguments_with_nul_bytes_fail_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new()
            .with_module("/lib/a.so", module("a", &[Phase::Init]))
            .with_module("/lib/b.so", module("b", &[Phase::Init]));
        let conf = dir.path().join("plugstack.conf");

        std::fs::write(&conf, b"optional /lib/a.so x\0y\nrequired /lib/b.so ok\n").unwrap();
        let stack = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap();
        assert_eq!(stack.plugin_names(), vec!["b"]);
        assert_eq!(stack.plugins()[0].argv(), ["ok".to_string()]);

        std::fs::write(&conf, b"required /lib/a.so x\0y\n").unwrap();
        let err = StackBuilder::new(&loader)
            .build(&conf, Context::Local)
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Required {
                source: ModuleError::InvalidArgument { .. },
                ..
            }
        ));
    }
}
