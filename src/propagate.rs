//! Carrying option values from the submission side to the execution node.
//!
//! After option parsing, srun exports every option it saw as
//! `_SLURM_SPANK_OPTION_<plugin>_<option>=<value>`, with every byte of the
//! plugin and option names that is not ASCII alphanumeric replaced by `_`. Options are also sent as job option records keyed `plugin:option`.
//! slurmstepd feeds both back to the registry and scrubs the variables from
//! the step environment.

use crate::environ::{getenvp, unsetenvp, Environ, JobEnv};
use crate::job::{JobOptionInfo, StepRecord, OPT_TYPE_SPANK};
use crate::option::{OptionError, OptionRegistry, PluginOpt};
use crate::sys::SPANK_OPTION_ENV_PREFIX;
use tracing::{debug, error};

/// Prefix added to job environment variables seen by prolog/epilog.
pub const SPANK_JOB_ENV_PREFIX: &str = "SPANK_";

/// Prefix of the variables users may set instead of passing options.
pub const SLURM_SPANK_ENV_PREFIX: &str = "SLURM_SPANK_";

/// Replaces every byte that is not ASCII alphanumeric with `_`. A multibyte
/// character becomes one `_` per byte.
pub fn mangle(name: &str) -> String {
    name.bytes()
        .map(|b| if b.is_ascii_alphanumeric() { b as char } else { '_' })
        .collect()
}

/// Environment variable carrying `option` of `plugin`.
pub fn option_env_name(plugin: &str, option: &str) -> String {
    format!(
        "{}{}_{}",
        SPANK_OPTION_ENV_PREFIX,
        mangle(plugin),
        mangle(option)
    )
}

fn env_name(opt: &PluginOpt) -> String {
    option_env_name(opt.plugin_name(), opt.name())
}

fn declared_name(opt: &PluginOpt) -> String {
    format!("{}:{}", opt.plugin_name(), opt.name())
}

/// Exports every option found on the command line into `env` and through
/// the job-control hook.
pub fn set_remote_options_env<E: Environ + ?Sized>(
    registry: &OptionRegistry,
    env: &mut E,
    job_env: &dyn JobEnv,
) {
    for opt in registry.iter().filter(|o| o.found()) {
        let var = env_name(opt);
        // Flags have no value; export them empty
        env.set(&var, opt.optarg().unwrap_or(""));

        if let Err(e) = job_env.set(&var, opt.optarg(), true) {
            error!(
                "failed to set {}={} in env: {}",
                var,
                opt.optarg().unwrap_or("(null)"),
                e
            );
        }
    }
}

/// Appends a job option record for every option found.
pub fn set_remote_options(registry: &OptionRegistry, job_options: &mut Vec<JobOptionInfo>) {
    for opt in registry.iter().filter(|o| o.found()) {
        job_options.push(JobOptionInfo::spank(&declared_name(opt), opt.optarg()));
    }
}

/// Applies the SPANK records of `job_options` on the execution side.
/// Returns the records that matched a registered option.
pub fn get_remote_options(
    registry: &mut OptionRegistry,
    job_options: &[JobOptionInfo],
) -> Vec<JobOptionInfo> {
    let mut found = Vec::new();

    for info in job_options.iter().filter(|j| j.kind == OPT_TYPE_SPANK) {
        let opt = match registry.find_by_declared_name(&info.option) {
            Some(opt) => opt,
            None => continue,
        };

        if opt.apply(info.optarg.as_deref(), true).is_err() {
            error!(
                "spank: failed to process option {}={}",
                opt.name(),
                info.optarg.as_deref().unwrap_or("")
            );
        }
        found.push(info.clone());
    }

    found
}

/// Applies the option variables of `env` for every option not already
/// received as a job option record, removing each variable it uses.
pub fn get_remote_options_env(
    registry: &mut OptionRegistry,
    env: &mut Vec<String>,
    found: &[JobOptionInfo],
) {
    for opt in registry.iter_mut() {
        let key = declared_name(opt);
        if found.iter().any(|f| f.option == key) {
            continue;
        }

        let var = env_name(opt);
        let arg = match getenvp(env, &var) {
            Some(arg) => arg.to_string(),
            None => continue,
        };

        if opt.apply(Some(&arg), true).is_err() {
            error!("spank: failed to process option {}={}", opt.name(), arg);
        }
        unsetenvp(env, &var);
    }
}

/// Removes every option variable, with or without the `SPANK_` prefix.
pub fn clear_remote_options_env(env: &mut Vec<String>) {
    env.retain(|entry| {
        let unprefixed = entry.strip_prefix(SPANK_JOB_ENV_PREFIX).unwrap_or(entry);
        let is_option =
            unprefixed.starts_with(SPANK_OPTION_ENV_PREFIX) && unprefixed.contains('=');
        if is_option {
            debug!("unsetenv ({})", entry.split('=').next().unwrap_or(entry));
        }
        !is_option
    });
}

/// Everything the execution side does with forwarded options, in order:
/// job option records, then environment variables, then scrubbing.
pub fn absorb_remote_options(registry: &mut OptionRegistry, step: &mut StepRecord) {
    let found = get_remote_options(registry, &step.options);
    get_remote_options_env(registry, &mut step.env, &found);
    clear_remote_options_env(&mut step.env);
}

/// Applies `SLURM_SPANK_<mangled>` variables set by the user, stopping at
/// the first value an option callback rejects.
pub fn process_env_options<E: Environ + ?Sized>(
    registry: &mut OptionRegistry,
    env: &E,
) -> Result<(), OptionError> {
    for opt in registry.iter_mut() {
        let var = format!("{}{}", SLURM_SPANK_ENV_PREFIX, env_name(opt));
        let arg = match env.get(&var) {
            Some(arg) => arg,
            None => continue,
        };

        if let Err(rc) = opt.apply(Some(&arg), false) {
            error!(
                "Invalid argument ({}) for environment variable: {}",
                arg, var
            );
            return Err(OptionError::Rejected {
                name: opt.name().to_string(),
                arg,
                rc,
            });
        }
        opt.mark_set_by_env();
    }
    Ok(())
}
