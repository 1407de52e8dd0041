//! What a plugin callback can see and change.

use crate::dispatch::Phase;
use crate::environ::{getenvp, setenvp, unsetenvp, Environ, ProcessEnv};
use crate::job::{JobContext, TaskInfo};
use crate::option::SpankOption;
use crate::propagate::{option_env_name, SPANK_JOB_ENV_PREFIX};
use crate::stack::Stack;
use crate::{
    Context, SpankError, SLURM_VERSION_MAJOR, SLURM_VERSION_MICRO, SLURM_VERSION_MINOR,
    SLURM_VERSION_STRING,
};
use libc::{gid_t, pid_t, uid_t};
use std::ffi::CStr;
use tracing::debug;

/// Something a plugin can ask about the job it runs for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Item {
    JobUid,
    JobGid,
    JobId,
    JobStepid,
    JobNnodes,
    JobNodeid,
    JobLocalTaskCount,
    JobTotalTaskCount,
    JobNcpus,
    JobArgv,
    JobEnv,
    TaskId,
    TaskGlobalId,
    TaskExitStatus,
    TaskPid,
    PidToGlobalId(pid_t),
    PidToLocalId(pid_t),
    LocalToGlobalId(u32),
    GlobalToLocalId(u32),
    JobSupplementaryGids,
    SlurmVersion,
    SlurmVersionMajor,
    SlurmVersionMinor,
    SlurmVersionMicro,
    StepCpusPerTask,
    JobAllocCores,
    JobAllocMem,
    StepAllocCores,
    StepAllocMem,
    SlurmRestartCount,
    JobArrayId,
    JobArrayTaskId,
}

impl Item {
    fn is_version(self) -> bool {
        matches!(
            self,
            Item::SlurmVersion
                | Item::SlurmVersionMajor
                | Item::SlurmVersionMinor
                | Item::SlurmVersionMicro
        )
    }

    fn valid_in_local_context(self) -> bool {
        matches!(
            self,
            Item::JobUid
                | Item::JobGid
                | Item::JobId
                | Item::JobStepid
                | Item::JobArgv
                | Item::JobEnv
                | Item::JobTotalTaskCount
                | Item::JobNnodes
        )
    }

    fn valid_in_allocator_context(self) -> bool {
        matches!(self, Item::JobUid | Item::JobGid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemValue {
    Uid(uid_t),
    Gid(gid_t),
    Gids(Vec<gid_t>),
    U16(u16),
    U32(u32),
    U64(u64),
    Int(i32),
    Pid(pid_t),
    Argv(Vec<String>),
    Env(Vec<String>),
    Str(Option<String>),
    Version(&'static str),
}

/// Handle given to a plugin for the duration of one callback.
#[derive(Debug)]
pub struct SpankHandle<'a> {
    stack: &'a mut Stack,
    plugin: usize,
    phase: Phase,
    job: JobContext<'a>,
    task: Option<usize>,
}

macro_rules! item_getter {
    ($(#[$meta:meta])* $name:ident, $item:ident, $variant:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $name(&self) -> Result<$ty, SpankError> {
            match self.get_item(Item::$item)? {
                ItemValue::$variant(value) => Ok(value),
                _ => Err(SpankError::Generic),
            }
        }
    };
}

impl<'a> SpankHandle<'a> {
    pub(crate) fn new(
        stack: &'a mut Stack,
        plugin: usize,
        phase: Phase,
        job: JobContext<'a>,
        task: Option<usize>,
    ) -> Self {
        SpankHandle {
            stack,
            plugin,
            phase,
            job,
            task,
        }
    }

    pub fn context(&self) -> Context {
        self.stack.kind()
    }

    /// Whether the callback runs in slurmstepd.
    pub fn remote(&self) -> bool {
        self.stack.kind() == Context::Remote
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plugin_name(&self) -> &str {
        self.stack.plugins()[self.plugin].name()
    }

    /// Arguments given to the plugin in `plugstack.conf`.
    pub fn plugin_argv(&self) -> &[String] {
        self.stack.plugins()[self.plugin].argv()
    }

    pub fn stack(&self) -> &Stack {
        &*self.stack
    }

    /// Declares a command line option. Only allowed from `init`.
    pub fn register_option(&mut self, opt: SpankOption) -> Result<(), SpankError> {
        if self.phase != Phase::Init {
            return Err(SpankError::BadArg);
        }
        if opt.name().is_empty() || opt.usage_text().is_none() {
            return Err(SpankError::BadArg);
        }

        let plugin_name = self.plugin_name().to_string();
        self.stack
            .options_mut()
            .register(self.plugin, &plugin_name, &opt)
            .map_err(SpankError::from)
    }

    /// Looks up the value of `opt` once options have been processed.
    ///
    /// Options unknown to the stack are searched for in the environment,
    /// which is how prolog and epilog see options given to srun, and the
    /// result is remembered. Returns `Err(Generic)` when the option was not
    /// used.
    pub fn getopt(&mut self, opt: &SpankOption) -> Result<Option<String>, SpankError> {
        self.getopt_with(opt, &ProcessEnv)
    }

    pub(crate) fn getopt_with<E: Environ + ?Sized>(
        &mut self,
        opt: &SpankOption,
        env: &E,
    ) -> Result<Option<String>, SpankError> {
        if matches!(
            self.phase,
            Phase::Init
                | Phase::InitPostOpt
                | Phase::StepTaskPostFork
                | Phase::SlurmdExit
                | Phase::Exit
        ) {
            return Err(SpankError::NotAvail);
        }
        if opt.name().is_empty() {
            return Err(SpankError::BadArg);
        }

        if let Some(cached) = self.stack.options().find_by_name(opt.name()) {
            if !cached.found() {
                return Err(SpankError::Generic);
            }
            return Ok(cached.optarg().filter(|_| opt.has_arg()).map(str::to_string));
        }

        let plugin_name = self.plugin_name().to_string();
        let var = option_env_name(&plugin_name, opt.name());
        // prolog/epilog see the job environment with an extra prefix
        let value = env
            .get(&var)
            .or_else(|| env.get(&format!("{}{}", SPANK_JOB_ENV_PREFIX, var)));
        let found = value.is_some();

        let cached = self
            .stack
            .options_mut()
            .cache(self.plugin, &plugin_name, opt, value);
        if !found {
            return Err(SpankError::Generic);
        }
        Ok(cached.optarg().filter(|_| opt.has_arg()).map(str::to_string))
    }

    /// [`getopt`](Self::getopt) for C plugins. The value is borrowed from the
    /// option registry so that the plugin may keep the pointer.
    pub(crate) fn getopt_c(&mut self, opt: &SpankOption) -> Result<Option<&CStr>, SpankError> {
        if self.getopt(opt)?.is_none() {
            return Ok(None);
        }
        Ok(self.stack.options_mut().optarg_c_str(opt.name()))
    }

    /// Value of an option registered by the calling plugin.
    pub fn get_option_value(&self, name: &str) -> Result<Option<String>, SpankError> {
        let opt = self
            .stack
            .options()
            .find(self.plugin_name(), name)
            .ok_or(SpankError::BadArg)?;
        Ok(opt.optarg().map(str::to_string))
    }

    pub fn is_option_set(&self, name: &str) -> bool {
        self.stack
            .options()
            .find(self.plugin_name(), name)
            .map_or(false, |o| o.is_set())
    }

    fn current_task(&self) -> Option<&TaskInfo> {
        let idx = self.task?;
        self.job.step()?.tasks.get(idx)
    }

    fn check_item_validity(&self, item: Item) -> Result<(), SpankError> {
        if item.is_version() {
            return Ok(());
        }

        match self.context() {
            Context::Slurmd => Err(SpankError::NotAvail),
            Context::JobScript => match item {
                Item::JobUid | Item::JobGid | Item::JobId => Ok(()),
                _ => Err(SpankError::NotAvail),
            },
            Context::Local if !item.valid_in_local_context() => Err(SpankError::NotRemote),
            Context::Local if self.job.is_none() => Err(SpankError::NotAvail),
            Context::Allocator if item.valid_in_allocator_context() && self.job.is_none() => {
                Err(SpankError::NotAvail)
            }
            Context::Allocator if item.valid_in_allocator_context() => Ok(()),
            Context::Allocator if item.valid_in_local_context() => Err(SpankError::BadArg),
            Context::Allocator => Err(SpankError::NotRemote),
            Context::Local | Context::Remote => Ok(()),
        }
    }

    /// Reads `item`, subject to what the current context allows.
    pub fn get_item(&self, item: Item) -> Result<ItemValue, SpankError> {
        self.check_item_validity(item)?;

        let kind = self.context();
        let launcher = self.job.launcher().filter(|_| kind == Context::Local);
        let step = self.job.step().filter(|_| kind == Context::Remote);
        let script = self.job.script().filter(|_| kind == Context::JobScript);
        let task = self.current_task();

        let value = match item {
            Item::JobUid => ItemValue::Uid(match kind {
                Context::Local => launcher.map(|j| j.uid),
                Context::Remote => step.map(|s| s.uid),
                Context::JobScript => script.map(|s| s.uid),
                _ => Some(unsafe { libc::getuid() }),
            }
            .ok_or(SpankError::NotAvail)?),
            Item::JobGid => ItemValue::Gid(match kind {
                Context::Local => launcher.map(|j| j.gid),
                Context::Remote => step.map(|s| s.gid),
                Context::JobScript => script.map(|s| s.gid),
                _ => Some(unsafe { libc::getgid() }),
            }
            .ok_or(SpankError::NotAvail)?),
            Item::JobSupplementaryGids => {
                ItemValue::Gids(step.map(|s| s.gids.clone()).unwrap_or_default())
            }
            Item::JobId => ItemValue::U32(match kind {
                Context::Local => launcher.map(|j| j.jobid),
                Context::Remote => step.map(|s| s.job_id),
                Context::JobScript => script.map(|s| s.jobid),
                _ => None,
            }
            .ok_or(SpankError::NotAvail)?),
            Item::JobStepid => ItemValue::U32(match kind {
                Context::Local => launcher.map(|j| j.stepid).ok_or(SpankError::NotAvail)?,
                _ => step.map_or(0, |s| s.step_id),
            }),
            Item::JobArrayId => ItemValue::U32(step.map_or(0, |s| s.array_job_id)),
            Item::JobArrayTaskId => ItemValue::U32(step.map_or(0, |s| s.array_task_id)),
            Item::JobNnodes => ItemValue::U32(match kind {
                Context::Local => {
                    let job = launcher.ok_or(SpankError::NotAvail)?;
                    job.step_layout
                        .map(|l| l.node_cnt)
                        .ok_or(SpankError::EnvNotExist)?
                }
                _ => step.map_or(0, |s| s.nnodes),
            }),
            Item::JobNodeid => ItemValue::U32(step.map_or(0, |s| s.nodeid)),
            Item::JobLocalTaskCount => ItemValue::U32(step.map_or(0, |s| s.node_tasks())),
            Item::JobTotalTaskCount => ItemValue::U32(match kind {
                Context::Local => {
                    let job = launcher.ok_or(SpankError::NotAvail)?;
                    job.step_layout
                        .map(|l| l.task_cnt)
                        .ok_or(SpankError::EnvNotExist)?
                }
                _ => step.map_or(0, |s| s.ntasks),
            }),
            Item::JobNcpus => ItemValue::U16(step.map_or(0, |s| s.cpus)),
            Item::StepCpusPerTask => ItemValue::U32(step.map_or(0, |s| s.cpus_per_task)),
            Item::JobArgv => ItemValue::Argv(match kind {
                Context::Local => launcher.map(|j| j.argv.clone()).unwrap_or_default(),
                _ => step.map(|s| s.argv.clone()).unwrap_or_default(),
            }),
            Item::JobEnv => ItemValue::Env(step.map(|s| s.env.clone()).unwrap_or_default()),
            Item::TaskId => ItemValue::Int(task.ok_or(SpankError::NotTask)?.id),
            Item::TaskGlobalId => ItemValue::U32(task.ok_or(SpankError::NotTask)?.gtid),
            Item::TaskExitStatus => ItemValue::Int(
                task.filter(|t| t.exited)
                    .ok_or(SpankError::NotTask)?
                    .estatus,
            ),
            Item::TaskPid => ItemValue::Pid(task.ok_or(SpankError::NotTask)?.pid),
            Item::PidToGlobalId(pid) => {
                if !self.phase.tasks_execd() {
                    return Err(SpankError::NotExecd);
                }
                let task = step
                    .and_then(|s| s.task_by_pid(pid))
                    .ok_or(SpankError::NoExist)?;
                ItemValue::U32(task.gtid)
            }
            Item::PidToLocalId(pid) => {
                if !self.phase.tasks_execd() {
                    return Err(SpankError::NotExecd);
                }
                let task = step
                    .and_then(|s| s.task_by_pid(pid))
                    .ok_or(SpankError::NoExist)?;
                ItemValue::U32(task.id as u32)
            }
            Item::LocalToGlobalId(id) => {
                let task = step
                    .and_then(|s| s.tasks.get(id as usize))
                    .ok_or(SpankError::NoExist)?;
                ItemValue::U32(task.gtid)
            }
            Item::GlobalToLocalId(gid) => {
                let step = step
                    .filter(|s| gid < s.ntasks)
                    .ok_or(SpankError::BadArg)?;
                let task = step
                    .tasks
                    .iter()
                    .find(|t| t.gtid == gid)
                    .ok_or(SpankError::NoExist)?;
                ItemValue::U32(task.id as u32)
            }
            Item::JobAllocCores => ItemValue::Str(step.and_then(|s| s.job_alloc_cores.clone())),
            Item::JobAllocMem => ItemValue::U64(step.map_or(0, |s| s.job_mem)),
            Item::StepAllocCores => {
                ItemValue::Str(step.and_then(|s| s.step_alloc_cores.clone()))
            }
            Item::StepAllocMem => ItemValue::U64(step.map_or(0, |s| s.step_mem)),
            Item::SlurmRestartCount => ItemValue::U32(step.map_or(0, |s| s.restart_cnt)),
            Item::SlurmVersion => ItemValue::Version(SLURM_VERSION_STRING),
            Item::SlurmVersionMajor => ItemValue::Version(SLURM_VERSION_MAJOR),
            Item::SlurmVersionMinor => ItemValue::Version(SLURM_VERSION_MINOR),
            Item::SlurmVersionMicro => ItemValue::Version(SLURM_VERSION_MICRO),
        };

        Ok(value)
    }

    item_getter!(job_uid, JobUid, Uid, uid_t);
    item_getter!(job_gid, JobGid, Gid, gid_t);
    item_getter!(job_supplementary_gids, JobSupplementaryGids, Gids, Vec<gid_t>);
    item_getter!(job_id, JobId, U32, u32);
    item_getter!(job_stepid, JobStepid, U32, u32);
    item_getter!(job_array_id, JobArrayId, U32, u32);
    item_getter!(job_array_task_id, JobArrayTaskId, U32, u32);
    item_getter!(job_nnodes, JobNnodes, U32, u32);
    item_getter!(job_nodeid, JobNodeid, U32, u32);
    item_getter!(
        /// Number of tasks of the step running on this node.
        job_local_task_count,
        JobLocalTaskCount,
        U32,
        u32
    );
    item_getter!(job_total_task_count, JobTotalTaskCount, U32, u32);
    item_getter!(job_ncpus, JobNcpus, U16, u16);
    item_getter!(step_cpus_per_task, StepCpusPerTask, U32, u32);
    item_getter!(job_argv, JobArgv, Argv, Vec<String>);
    item_getter!(job_env, JobEnv, Env, Vec<String>);
    item_getter!(task_id, TaskId, Int, i32);
    item_getter!(task_global_id, TaskGlobalId, U32, u32);
    item_getter!(
        /// Exit status of the current task, once it has exited.
        task_exit_status,
        TaskExitStatus,
        Int,
        i32
    );
    item_getter!(task_pid, TaskPid, Pid, pid_t);
    item_getter!(job_alloc_cores, JobAllocCores, Str, Option<String>);
    item_getter!(job_alloc_mem, JobAllocMem, U64, u64);
    item_getter!(step_alloc_cores, StepAllocCores, Str, Option<String>);
    item_getter!(step_alloc_mem, StepAllocMem, U64, u64);
    item_getter!(slurm_restart_count, SlurmRestartCount, U32, u32);
    item_getter!(slurm_version, SlurmVersion, Version, &'static str);
    item_getter!(slurm_version_major, SlurmVersionMajor, Version, &'static str);
    item_getter!(slurm_version_minor, SlurmVersionMinor, Version, &'static str);
    item_getter!(slurm_version_micro, SlurmVersionMicro, Version, &'static str);

    fn u32_item(&self, item: Item) -> Result<u32, SpankError> {
        match self.get_item(item)? {
            ItemValue::U32(value) => Ok(value),
            _ => Err(SpankError::Generic),
        }
    }

    pub fn pid_to_global_id(&self, pid: pid_t) -> Result<u32, SpankError> {
        self.u32_item(Item::PidToGlobalId(pid))
    }
    pub fn pid_to_local_id(&self, pid: pid_t) -> Result<u32, SpankError> {
        self.u32_item(Item::PidToLocalId(pid))
    }
    pub fn local_to_global_id(&self, local_id: u32) -> Result<u32, SpankError> {
        self.u32_item(Item::LocalToGlobalId(local_id))
    }
    pub fn global_to_local_id(&self, global_id: u32) -> Result<u32, SpankError> {
        self.u32_item(Item::GlobalToLocalId(global_id))
    }

    fn env_access_check(&self) -> Result<(), SpankError> {
        if !self.remote() {
            return Err(SpankError::NotRemote);
        }
        if self.job.step().is_none() {
            return Err(SpankError::BadArg);
        }
        Ok(())
    }

    /// Reads a variable of the job step environment.
    pub fn getenv(&self, name: &str) -> Result<Option<String>, SpankError> {
        self.env_access_check()?;
        Ok(self
            .job
            .step()
            .and_then(|s| getenvp(&s.env, name))
            .map(str::to_string))
    }

    pub fn setenv(&mut self, name: &str, value: &str, overwrite: bool) -> Result<(), SpankError> {
        self.env_access_check()?;
        let step = self.job.step_mut().ok_or(SpankError::BadArg)?;
        if !setenvp(&mut step.env, name, value, overwrite) {
            return Err(SpankError::EnvExists);
        }
        Ok(())
    }

    pub fn unsetenv(&mut self, name: &str) -> Result<(), SpankError> {
        self.env_access_check()?;
        let step = self.job.step_mut().ok_or(SpankError::BadArg)?;
        unsetenvp(&mut step.env, name);
        Ok(())
    }

    fn job_control_access_check(&self) -> Result<(), SpankError> {
        match self.context() {
            Context::Remote => Err(SpankError::NotLocal),
            Context::Slurmd => Err(SpankError::NotAvail),
            _ => Ok(()),
        }
    }

    /// Reads a variable of the job control environment, which srun, sbatch
    /// and salloc forward to prolog and epilog.
    pub fn job_control_getenv(&self, name: &str) -> Result<Option<String>, SpankError> {
        self.job_control_access_check()?;
        Ok(self.stack.job_env().get(name))
    }

    pub fn job_control_setenv(
        &self,
        name: &str,
        value: &str,
        overwrite: bool,
    ) -> Result<(), SpankError> {
        self.job_control_access_check()?;
        self.stack
            .job_env()
            .set(name, Some(value), overwrite)
            .map_err(|e| {
                debug!("spank: job_control_setenv {}: {}", name, e);
                SpankError::BadArg
            })
    }

    pub fn job_control_unsetenv(&self, name: &str) -> Result<(), SpankError> {
        self.job_control_access_check()?;
        self.stack.job_env().unset(name).map_err(|e| {
            debug!("spank: job_control_unsetenv {}: {}", name, e);
            SpankError::BadArg
        })
    }

    /// Puts `args` in front of the command line of the current task, for
    /// wrapping it in another program.
    pub fn prepend_task_argv(&mut self, args: &[&str]) -> Result<(), SpankError> {
        if !matches!(
            self.phase,
            Phase::StepTaskInitPriv | Phase::StepUserTaskInit
        ) {
            return Err(SpankError::NotTask);
        }
        let idx = self.task.ok_or(SpankError::NotTask)?;
        let task = self
            .job
            .step_mut()
            .and_then(|s| s.tasks.get_mut(idx))
            .ok_or(SpankError::NotTask)?;

        let mut argv: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        argv.append(&mut task.argv);
        task.argv = argv;
        Ok(())
    }
}
