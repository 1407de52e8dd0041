use spank_stack::option::SPANK_OPTVAL_BASE;
use spank_stack::propagate::{
    absorb_remote_options, mangle, option_env_name, set_remote_options, set_remote_options_env,
};
use spank_stack::{
    call_stack, CliOption, Context, JobContext, Module, NoJobEnv, Operations, Phase, SpankError,
    SpankHandle, SpankOption, StackBuilder, StaticLoader, StepRecord,
};
use std::fs;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn foo() -> SpankOption {
    SpankOption::new("foo").takes_value("value").usage("Set foo")
}

/// Registers `--foo` at init and reports what `getopt` returns for it in
/// user_init.
fn myplug(seen: Arc<Mutex<Option<Result<Option<String>, SpankError>>>>) -> Module {
    let ops = Operations::new()
        .with(Phase::Init, |spank: &mut SpankHandle<'_>, _: &[String]| {
            match spank.register_option(foo()) {
                Ok(()) => 0,
                Err(e) => u32::from(e) as c_int,
            }
        })
        .with(Phase::StepUserInit, move |spank, _| {
            *seen.lock().unwrap() = Some(spank.getopt(&foo()));
            0
        });
    Module::new("myplug", ops)
}

fn write_conf(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("plugstack.conf");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn option_values_travel_from_srun_to_slurmstepd() {
    let seen = Arc::new(Mutex::new(None));
    let dir = tempfile::tempdir().unwrap();
    let loader = StaticLoader::new().with_module("/lib/myplug.so", myplug(seen.clone()));
    let conf = write_conf(dir.path(), "required /lib/myplug.so\n");
    let builder = StackBuilder::new(&loader);

    // srun
    let mut local = builder.build(&conf, Context::Local).unwrap();
    call_stack(Some(&mut local), Phase::Init, JobContext::None, None).unwrap();
    let table = local
        .options_mut()
        .table_create(&[CliOption::new("help", false, 'h' as c_int)]);
    assert_eq!(table[1], CliOption::new("foo", true, SPANK_OPTVAL_BASE));
    local
        .options_mut()
        .process_value(SPANK_OPTVAL_BASE, Some("bar"))
        .unwrap();

    let mut env: Vec<String> = vec!["PATH=/bin".to_string()];
    set_remote_options_env(local.options(), &mut env, &NoJobEnv);
    assert!(env.contains(&"_SLURM_SPANK_OPTION_myplug_foo=bar".to_string()));

    // slurmstepd
    let mut step = StepRecord {
        env,
        ..Default::default()
    };
    let mut remote = builder.build(&conf, Context::Remote).unwrap();
    call_stack(
        Some(&mut remote),
        Phase::Init,
        JobContext::Step(&mut step),
        None,
    )
    .unwrap();
    absorb_remote_options(remote.options_mut(), &mut step);
    assert_eq!(step.env, vec!["PATH=/bin".to_string()]);

    call_stack(
        Some(&mut remote),
        Phase::StepUserInit,
        JobContext::Step(&mut step),
        None,
    )
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(Ok(Some("bar".to_string()))));
}

#[test]
fn job_option_records_reach_the_remote_registry() {
    let seen = Arc::new(Mutex::new(None));
    let dir = tempfile::tempdir().unwrap();
    let loader = StaticLoader::new().with_module("/lib/myplug.so", myplug(seen.clone()));
    let conf = write_conf(dir.path(), "required /lib/myplug.so\n");
    let builder = StackBuilder::new(&loader);

    let mut local = builder.build(&conf, Context::Local).unwrap();
    call_stack(Some(&mut local), Phase::Init, JobContext::None, None).unwrap();
    local
        .options_mut()
        .process_value(SPANK_OPTVAL_BASE, Some("baz"))
        .unwrap();
    let mut step = StepRecord::default();
    set_remote_options(local.options(), &mut step.options);

    let mut remote = builder.build(&conf, Context::Remote).unwrap();
    call_stack(
        Some(&mut remote),
        Phase::Init,
        JobContext::Step(&mut step),
        None,
    )
    .unwrap();
    absorb_remote_options(remote.options_mut(), &mut step);
    call_stack(
        Some(&mut remote),
        Phase::StepUserInit,
        JobContext::Step(&mut step),
        None,
    )
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(Ok(Some("baz".to_string()))));
}

#[test]
fn unused_options_are_reported_as_errors() {
    let seen = Arc::new(Mutex::new(None));
    let dir = tempfile::tempdir().unwrap();
    let loader = StaticLoader::new().with_module("/lib/myplug.so", myplug(seen.clone()));
    let conf = write_conf(dir.path(), "required /lib/myplug.so\n");

    let mut remote = StackBuilder::new(&loader)
        .build(&conf, Context::Remote)
        .unwrap();
    call_stack(Some(&mut remote), Phase::Init, JobContext::None, None).unwrap();
    call_stack(Some(&mut remote), Phase::StepUserInit, JobContext::None, None).unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(Err(SpankError::Generic)));
}

#[test]
fn second_plugin_with_the_same_option_is_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let with_flag = |name: &str| {
        Module::new(name, Operations::new().with(Phase::Init, |_, _| 0))
            .with_options(vec![SpankOption::new("flag").usage("a flag")])
    };
    let loader = StaticLoader::new()
        .with_module("/lib/first.so", with_flag("first"))
        .with_module("/lib/second.so", with_flag("second"));
    let conf = write_conf(dir.path(), "required /lib/first.so\nrequired /lib/second.so\n");

    let mut stack = StackBuilder::new(&loader)
        .build(&conf, Context::Local)
        .unwrap();
    let options: Vec<_> = stack
        .options()
        .iter()
        .map(|o| (o.plugin_name().to_string(), o.disabled()))
        .collect();
    assert_eq!(
        options,
        vec![("first".to_string(), false), ("second".to_string(), true)]
    );

    let table = stack.options_mut().table_create(&[]);
    assert_eq!(table, vec![CliOption::new("flag", false, SPANK_OPTVAL_BASE)]);
}

#[test]
fn names_are_mangled_for_the_environment() {
    assert_eq!(mangle("my-plug.v2"), "my_plug_v2");
    assert_eq!(
        option_env_name("auto-tune", "cpu.freq"),
        "_SLURM_SPANK_OPTION_auto_tune_cpu_freq"
    );
}
