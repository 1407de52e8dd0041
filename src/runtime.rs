//! Process-wide stack and the host lifecycle.
//!
//! A host process runs one stack at a time. [`Spank`] builds it at init,
//! keeps it in a global slot for the later phases and tears it down at exit.
//! The option helpers below act on whatever stack is installed.

use crate::config::Config;
use crate::dispatch::{call_stack, CallError, Phase};
use crate::environ::{JobEnv, NoJobEnv, ProcessEnv};
use crate::job::{JobContext, JobOptionInfo, JobScriptInfo, LauncherJobInfo, StepRecord};
use crate::loader::{DlLoader, PluginLoader};
use crate::option::{CliOption, OptionError};
use crate::propagate;
use crate::stack::{LoadError, Stack, StackBuilder};
use crate::sys::SPANK_SYMS;
use crate::Context;
use lazy_static::lazy_static;
use libc::{gid_t, uid_t};
use std::io::{self, Write};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

lazy_static! {
    static ref CURRENT: Mutex<Option<Stack>> = Mutex::new(None);
}

// Readable while a plugin runs, when CURRENT is empty
static CURRENT_CONTEXT: AtomicU32 = AtomicU32::new(0);

fn slot() -> MutexGuard<'static, Option<Stack>> {
    CURRENT.lock().unwrap_or_else(PoisonError::into_inner)
}

fn replace_locked(slot: &mut Option<Stack>, stack: Option<Stack>) -> Option<Stack> {
    let context = stack.as_ref().map_or(0, |s| u32::from(s.kind()));
    CURRENT_CONTEXT.store(context, Ordering::SeqCst);
    std::mem::replace(slot, stack)
}

/// Makes `stack` the current one, returning the one it replaces.
pub fn install(stack: Stack) -> Option<Stack> {
    replace_locked(&mut slot(), Some(stack))
}

/// Removes the current stack.
pub fn clear() -> Option<Stack> {
    replace_locked(&mut slot(), None)
}

/// Context of the current stack. Does not lock the stack, so plugins may
/// call it from their callbacks.
pub fn current_context() -> Option<Context> {
    Context::try_from(CURRENT_CONTEXT.load(Ordering::SeqCst)).ok()
}

/// Runs `f` on the current stack. Called from a plugin callback, `f` gets
/// `None`: the stack is in use by the phase being dispatched.
pub fn with_current<R>(f: impl FnOnce(Option<&mut Stack>) -> R) -> R {
    f(slot().as_mut())
}

/// Whether `name` is one of the symbols a plugin may export.
pub fn symbol_supported(name: &str) -> bool {
    SPANK_SYMS.iter().any(|sym| *sym == name)
}

/// Holds the current stack while its plugins run. The slot stays empty
/// meanwhile, so callbacks using the helpers of this module see no stack
/// instead of waiting on the lock. Dropping it puts the stack back.
struct Lent(Option<Stack>);

impl Lent {
    fn take() -> Self {
        // The context is left as is: plugins still see it
        Lent(slot().take())
    }
}

impl Drop for Lent {
    fn drop(&mut self) {
        let stack = self.0.take();
        replace_locked(&mut slot(), stack);
    }
}

fn dispatch_current(
    phase: Phase,
    job: JobContext<'_>,
    taskid: Option<usize>,
) -> Result<(), CallError> {
    let mut lent = Lent::take();
    call_stack(lent.0.as_mut(), phase, job, taskid)
}

/// Adds the options of the current stack to a getopt table.
pub fn option_table_create(builtin: &[CliOption]) -> Vec<CliOption> {
    with_current(|stack| match stack {
        Some(stack) => stack.options_mut().table_create(builtin),
        None => builtin.to_vec(),
    })
}

/// Feeds a command line value to the plugin option owning `optval`.
pub fn process_option(optval: c_int, arg: Option<&str>) -> Result<(), OptionError> {
    with_current(|stack| match stack {
        Some(stack) => stack.options_mut().process_value(optval, arg),
        None => Err(OptionError::NoCache),
    })
}

/// Applies the `SLURM_SPANK_*` variables of the process environment.
pub fn process_env_options() -> Result<(), OptionError> {
    with_current(|stack| match stack {
        Some(stack) => propagate::process_env_options(stack.options_mut(), &ProcessEnv),
        None => Ok(()),
    })
}

pub fn print_options<W: Write>(w: &mut W, left_pad: usize, width: usize) -> io::Result<()> {
    with_current(|stack| match stack {
        Some(stack) => stack.options().print(w, left_pad, width),
        None => Ok(()),
    })
}

/// Records every option found as a job option of the launch request.
pub fn set_remote_options(job_options: &mut Vec<JobOptionInfo>) {
    with_current(|stack| {
        if let Some(stack) = stack {
            propagate::set_remote_options(stack.options(), job_options);
        }
    })
}

pub fn plugin_names() -> Vec<String> {
    with_current(|stack| stack.map(|s| s.plugin_names()).unwrap_or_default())
}

pub fn plugin_option_names(plugin_name: &str) -> Vec<String> {
    with_current(|stack| {
        stack
            .map(|s| s.options().plugin_option_names(plugin_name))
            .unwrap_or_default()
    })
}

pub fn option_get(name: &str) -> Option<String> {
    with_current(|stack| stack.and_then(|s| s.options().option_get(name)))
}

pub fn option_plugin(name: &str) -> Option<String> {
    with_current(|stack| stack.and_then(|s| s.options().option_plugin(name)))
}

pub fn option_isset(name: &str) -> bool {
    with_current(|stack| stack.map_or(false, |s| s.options().option_isset(name)))
}

pub fn options_set() -> Vec<(String, String, String)> {
    with_current(|stack| stack.map(|s| s.options().options_set()).unwrap_or_default())
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Option(#[from] OptionError),
}

/// Drives the plugin stack through the phases of a host process.
pub struct Spank {
    config: Config,
    loader: Box<dyn PluginLoader + Send + Sync>,
    job_env: Arc<dyn JobEnv>,
}

impl Spank {
    /// Loads shared object plugins, with no job control hook.
    pub fn new(config: Config) -> Self {
        Spank {
            config,
            loader: Box::new(DlLoader),
            job_env: Arc::new(NoJobEnv),
        }
    }

    pub fn with_loader<L: PluginLoader + Send + Sync + 'static>(mut self, loader: L) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn with_job_env(mut self, job_env: Arc<dyn JobEnv>) -> Self {
        self.job_env = job_env;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn build(&self, kind: Context) -> Result<Stack, LoadError> {
        let stack = StackBuilder::new(&*self.loader)
            .plugin_path(&self.config.plugin_dir)
            .job_env(self.job_env.clone())
            .build(&self.config.plugstack, kind)?;
        debug!(
            "spank: {:?} stack with {} plugins",
            kind,
            stack.plugins().len()
        );
        Ok(stack)
    }

    fn start(&self, kind: Context, job: JobContext<'_>) -> Result<(), RuntimeError> {
        let stack = self.build(kind)?;
        install(stack);
        Ok(dispatch_current(Phase::Init, job, None)?)
    }

    fn dispatch(
        &self,
        phase: Phase,
        job: JobContext<'_>,
        taskid: Option<usize>,
    ) -> Result<(), RuntimeError> {
        Ok(dispatch_current(phase, job, taskid)?)
    }

    /// Loads the stack and runs `init`: in srun without a step, in
    /// slurmstepd with one. slurmstepd then takes in the options forwarded
    /// by srun and runs `init_post_opt`.
    pub fn init(&self, step: Option<&mut StepRecord>) -> Result<(), RuntimeError> {
        let step = match step {
            Some(step) => step,
            None => return self.start(Context::Local, JobContext::None),
        };

        self.start(Context::Remote, JobContext::Step(&mut *step))?;
        with_current(|stack| {
            if let Some(stack) = stack {
                propagate::absorb_remote_options(stack.options_mut(), &mut *step);
            }
        });
        self.dispatch(Phase::InitPostOpt, JobContext::Step(step), None)
    }

    /// sbatch/salloc.
    pub fn init_allocator(&self) -> Result<(), RuntimeError> {
        self.start(Context::Allocator, JobContext::None)
    }

    pub fn slurmd_init(&self) -> Result<(), RuntimeError> {
        self.start(Context::Slurmd, JobContext::None)
    }

    /// Exports the options given on the command line for the remote side,
    /// then runs `init_post_opt`.
    pub fn init_post_opt(&self) -> Result<(), RuntimeError> {
        with_current(|stack| {
            if let Some(stack) = stack {
                propagate::set_remote_options_env(stack.options(), &mut ProcessEnv, stack.job_env());
            }
        });
        self.dispatch(Phase::InitPostOpt, JobContext::None, None)
    }

    pub fn user(&self, step: &mut StepRecord) -> Result<(), RuntimeError> {
        self.dispatch(Phase::StepUserInit, JobContext::Step(step), None)
    }

    pub fn local_user(&self, job: &mut LauncherJobInfo) -> Result<(), RuntimeError> {
        self.dispatch(Phase::LocalUserInit, JobContext::Launcher(job), None)
    }

    pub fn task_privileged(&self, step: &mut StepRecord, taskid: usize) -> Result<(), RuntimeError> {
        self.dispatch(Phase::StepTaskInitPriv, JobContext::Step(step), Some(taskid))
    }

    pub fn user_task(&self, step: &mut StepRecord, taskid: usize) -> Result<(), RuntimeError> {
        self.dispatch(Phase::StepUserTaskInit, JobContext::Step(step), Some(taskid))
    }

    pub fn task_post_fork(&self, step: &mut StepRecord, taskid: usize) -> Result<(), RuntimeError> {
        self.dispatch(Phase::StepTaskPostFork, JobContext::Step(step), Some(taskid))
    }

    pub fn task_exit(&self, step: &mut StepRecord, taskid: usize) -> Result<(), RuntimeError> {
        self.dispatch(Phase::StepTaskExit, JobContext::Step(step), Some(taskid))
    }

    /// Runs `slurmd_exit` and unloads the stack.
    pub fn slurmd_exit(&self) -> Result<(), RuntimeError> {
        let result = self.dispatch(Phase::SlurmdExit, JobContext::None, None);
        clear();
        result
    }

    /// Runs `exit` and unloads the stack.
    pub fn fini(&self, step: Option<&mut StepRecord>) -> Result<(), RuntimeError> {
        let job = match step {
            Some(step) => JobContext::Step(step),
            None => JobContext::None,
        };
        let result = self.dispatch(Phase::Exit, job, None);
        clear();
        result
    }

    fn job_script(&self, phase: Phase, info: JobScriptInfo) -> Result<(), RuntimeError> {
        let stack = self.build(Context::JobScript)?;
        let previous = install(stack);

        let result = dispatch_current(phase, JobContext::Script(&info), None);
        replace_locked(&mut slot(), previous);
        Ok(result?)
    }

    /// Runs the job prolog of every plugin on a dedicated stack. Options
    /// given to srun reach the plugins through the environment.
    pub fn job_prolog(&self, jobid: u32, uid: uid_t, gid: gid_t) -> Result<(), RuntimeError> {
        self.job_script(Phase::JobProlog, JobScriptInfo { jobid, uid, gid })
    }

    pub fn job_epilog(&self, jobid: u32, uid: uid_t, gid: gid_t) -> Result<(), RuntimeError> {
        self.job_script(Phase::JobEpilog, JobScriptInfo { jobid, uid, gid })
    }
}

#[cfg(test)]
lazy_static! {
    /// Serializes tests using the process-wide slot.
    pub(crate) static ref SERIAL: Mutex<()> = Mutex::new(());
}

#[cfg(test)]
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::SpankHandle;
    use crate::loader::{Module, Operations, StaticLoader};
    use crate::option::{SpankOption, SPANK_OPTVAL_BASE};
    use std::fs;
    use std::path::Path;

    fn spank(dir: &Path, conf: &str, loader: StaticLoader) -> Spank {
        let plugstack = dir.join("plugstack.conf");
        fs::write(&plugstack, conf).unwrap();
        Spank::new(Config {
            plugstack,
            plugin_dir: String::new(),
        })
        .with_loader(loader)
    }

    fn renice() -> Module {
        let ops = Operations::new()
            .with(Phase::Init, |spank: &mut SpankHandle<'_>, _: &[String]| {
                let opt = SpankOption::new("prio").takes_value("n").usage("priority");
                match spank.register_option(opt) {
                    Ok(()) => 0,
                    Err(e) => u32::from(e) as c_int,
                }
            })
            .with(Phase::Exit, |_, _| 0);
        Module::new("renice", ops)
    }

    #[test]
    fn slot_tracks_the_context() {
        let _guard = serial();
        clear();
        assert_eq!(current_context(), None);

        install(Stack::empty(Context::Allocator));
        assert_eq!(current_context(), Some(Context::Allocator));
        let previous = install(Stack::empty(Context::Slurmd)).unwrap();
        assert_eq!(previous.kind(), Context::Allocator);

        clear();
        assert_eq!(current_context(), None);
        assert!(plugin_names().is_empty());
        assert_eq!(process_option(SPANK_OPTVAL_BASE, None), Err(OptionError::NoCache));
    }

    #[test]
    fn symbols() {
        assert!(symbol_supported("slurm_spank_init"));
        assert!(symbol_supported("slurm_spank_init_failure_mode"));
        assert!(!symbol_supported("slurm_spank_bogus"));
    }

    #[test]
    fn local_lifecycle() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module("/lib/renice.so", renice());
        let spank = spank(dir.path(), "required /lib/renice.so\n", loader);

        spank.init(None).unwrap();
        assert_eq!(current_context(), Some(Context::Local));
        assert_eq!(plugin_names(), vec!["renice"]);
        assert_eq!(plugin_option_names("renice"), vec!["prio"]);

        let table = option_table_create(&[CliOption::new("help", false, 'h' as c_int)]);
        assert_eq!(table.len(), 2);
        process_option(table[1].val, Some("10")).unwrap();
        assert_eq!(option_get("prio").as_deref(), Some("10"));
        assert_eq!(option_plugin("prio").as_deref(), Some("renice"));
        assert!(option_isset("prio"));

        let mut records = Vec::new();
        set_remote_options(&mut records);
        assert_eq!(records, vec![JobOptionInfo::spank("renice:prio", Some("10"))]);

        let mut help = Vec::new();
        print_options(&mut help, 2, 24).unwrap();
        assert!(String::from_utf8(help).unwrap().contains("--prio=n"));

        spank.fini(None).unwrap();
        assert_eq!(current_context(), None);
    }

    #[test]
    fn remote_init_absorbs_forwarded_options() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module("/lib/renice.so", renice());
        let spank = spank(dir.path(), "required /lib/renice.so\n", loader);

        let mut step = StepRecord {
            options: vec![JobOptionInfo::spank("renice:prio", Some("5"))],
            env: vec![
                "_SLURM_SPANK_OPTION_renice_prio=5".to_string(),
                "PATH=/bin".to_string(),
            ],
            ..Default::default()
        };
        spank.init(Some(&mut step)).unwrap();

        assert_eq!(current_context(), Some(Context::Remote));
        assert_eq!(option_get("prio").as_deref(), Some("5"));
        assert_eq!(step.env, vec!["PATH=/bin".to_string()]);

        spank.fini(Some(&mut step)).unwrap();
    }

    #[test]
    fn callbacks_may_query_the_runtime() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let loader = StaticLoader::new().with_module(
            "/lib/nosy.so",
            Module::new(
                "nosy",
                Operations::new().with(Phase::Init, move |spank, _| {
                    record.lock().unwrap().push((
                        plugin_names(),
                        option_isset("prio"),
                        current_context(),
                        spank.stack().plugin_names(),
                    ));
                    0
                }),
            ),
        );
        let spank = spank(dir.path(), "required /lib/nosy.so\n", loader);

        let worker = std::thread::spawn(move || {
            let result = spank.init(None).map_err(|e| e.to_string());
            tx.send(result).unwrap();
            spank
        });
        let result = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("init did not return");
        assert_eq!(result, Ok(()));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                Vec::<String>::new(),
                false,
                Some(Context::Local),
                vec!["nosy".to_string()]
            )]
        );
        // The stack is back in the slot once init returns
        assert_eq!(plugin_names(), vec!["nosy"]);
        worker.join().unwrap().fini(None).unwrap();
        assert_eq!(current_context(), None);
    }

    #[test]
    fn job_script_stack_is_temporary() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let loader = StaticLoader::new().with_module(
            "/lib/prolog.so",
            Module::new(
                "prolog",
                Operations::new().with(Phase::JobProlog, |spank, _| {
                    match (spank.context(), spank.job_id()) {
                        (Context::JobScript, Ok(77)) => 0,
                        _ => 1,
                    }
                }),
            ),
        );
        let spank = spank(dir.path(), "required /lib/prolog.so\n", loader);

        install(Stack::empty(Context::Slurmd));
        spank.job_prolog(77, 0, 0).unwrap();
        assert_eq!(current_context(), Some(Context::Slurmd));

        // No epilog callback: nothing runs, nothing fails
        spank.job_epilog(77, 0, 0).unwrap();
        clear();
    }

    #[test]
    fn load_errors_leave_the_slot_alone() {
        let _guard = serial();
        clear();
        let dir = tempfile::tempdir().unwrap();
        let spank = spank(dir.path(), "required /lib/missing.so\n", StaticLoader::new());

        assert!(matches!(
            spank.init_allocator(),
            Err(RuntimeError::Load(LoadError::Required { .. }))
        ));
        assert_eq!(current_context(), None);
    }
}
