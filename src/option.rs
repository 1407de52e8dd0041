//! Plugin provided command line options.

use crate::sys::SPANK_OPTION_MAXLEN;
use crate::SpankError;
use std::ffi::{CStr, CString};
use std::fmt;
use std::io::{self, Write};
use std::os::raw::c_int;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// First token handed out, well above the values of built-in CLI options.
pub const SPANK_OPTVAL_BASE: c_int = 0xfff;

/// Option callback: `(val, optarg, remote) -> rc`, non-zero rejects the value.
pub type OptionCallback = Arc<dyn Fn(c_int, Option<&str>, bool) -> c_int + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("no spank option cache")]
    NoCache,
    #[error("failed to find spank option for optval: {0}")]
    UnknownValue(c_int),
    #[error("option \"{0}\" too long")]
    NameTooLong(String),
    #[error("invalid --{name} argument: {arg} (rc={rc})")]
    Rejected { name: String, arg: String, rc: c_int },
}

impl From<OptionError> for SpankError {
    fn from(err: OptionError) -> Self {
        match err {
            OptionError::NameTooLong(_) => SpankError::NoSpace,
            OptionError::UnknownValue(_) => SpankError::NoExist,
            OptionError::NoCache | OptionError::Rejected { .. } => SpankError::Generic,
        }
    }
}

/// An option declaration, either taken from a plugin's static table or
/// registered from its init callback.
#[derive(Clone)]
pub struct SpankOption {
    name: String,
    arginfo: Option<String>,
    usage: Option<String>,
    has_arg: bool,
    val: c_int,
    cb: Option<OptionCallback>,
}

impl SpankOption {
    pub fn new(name: &str) -> Self {
        SpankOption {
            name: name.to_string(),
            arginfo: None,
            usage: None,
            has_arg: false,
            val: 0,
            cb: None,
        }
    }
    pub fn usage(mut self, usage: &str) -> Self {
        self.usage = Some(usage.to_string());
        self
    }
    pub fn takes_value(mut self, arg_name: &str) -> Self {
        self.arginfo = Some(arg_name.to_string());
        self.has_arg = true;
        self
    }
    /// Plugin private tag handed back to the callback.
    pub fn val(mut self, val: c_int) -> Self {
        self.val = val;
        self
    }
    pub fn callback<F>(self, cb: F) -> Self
    where
        F: Fn(c_int, Option<&str>, bool) -> c_int + Send + Sync + 'static,
    {
        self.with_callback(Arc::new(cb))
    }
    pub fn with_callback(mut self, cb: OptionCallback) -> Self {
        self.cb = Some(cb);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn arginfo(&self) -> Option<&str> {
        self.arginfo.as_deref()
    }
    pub fn usage_text(&self) -> Option<&str> {
        self.usage.as_deref()
    }
    pub fn has_arg(&self) -> bool {
        self.has_arg
    }
    pub fn tag(&self) -> c_int {
        self.val
    }
    pub fn callback_fn(&self) -> Option<&OptionCallback> {
        self.cb.as_ref()
    }
}

impl fmt::Debug for SpankOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpankOption")
            .field("name", &self.name)
            .field("arginfo", &self.arginfo)
            .field("usage", &self.usage)
            .field("has_arg", &self.has_arg)
            .field("val", &self.val)
            .field("cb", &self.cb.is_some())
            .finish()
    }
}

/// A registered option instance.
#[derive(Debug, Clone)]
pub struct PluginOpt {
    opt: SpankOption,
    plugin: usize,
    plugin_name: String,
    optval: c_int,
    found: bool,
    disabled: bool,
    optarg: Option<String>,
    // Handed to C plugins by spank_option_getopt, built on first use
    c_optarg: Option<CString>,
    set: bool,
    set_by_env: bool,
}

impl PluginOpt {
    pub fn option(&self) -> &SpankOption {
        &self.opt
    }
    pub fn name(&self) -> &str {
        &self.opt.name
    }
    /// Index of the owning plugin in its stack.
    pub fn plugin(&self) -> usize {
        self.plugin
    }
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }
    pub fn optval(&self) -> c_int {
        self.optval
    }
    pub fn found(&self) -> bool {
        self.found
    }
    pub fn disabled(&self) -> bool {
        self.disabled
    }
    pub fn optarg(&self) -> Option<&str> {
        self.optarg.as_deref()
    }
    pub fn is_set(&self) -> bool {
        self.set
    }
    pub fn set_by_env(&self) -> bool {
        self.set_by_env
    }
    pub(crate) fn mark_set_by_env(&mut self) {
        self.set_by_env = true;
    }

    /// Runs the plugin callback and records the value.
    ///
    /// Returns the callback's status when it rejects the value, in which case
    /// nothing is stored.
    pub(crate) fn apply(&mut self, arg: Option<&str>, remote: bool) -> Result<(), c_int> {
        if let Some(cb) = &self.opt.cb {
            let rc = cb(self.opt.val, arg, remote);
            if rc != 0 {
                return Err(rc);
            }
        }

        // Set optarg and "found" so that the option is forwarded to the remote side
        if self.opt.has_arg {
            self.optarg = arg.map(str::to_string);
            self.c_optarg = None;
        }
        self.found = true;
        self.set = true;
        Ok(())
    }

    fn display_value(&self) -> Option<String> {
        match (&self.optarg, self.set) {
            (Some(arg), _) => Some(arg.clone()),
            (None, true) => Some("set".to_string()),
            (None, false) if !self.opt.has_arg => Some("unset".to_string()),
            (None, false) => None,
        }
    }
}

/// An entry of a getopt style option table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOption {
    pub name: String,
    pub has_arg: bool,
    pub val: c_int,
}

impl CliOption {
    pub fn new(name: &str, has_arg: bool, val: c_int) -> Self {
        CliOption {
            name: name.to_string(),
            has_arg,
            val,
        }
    }
}

/// Every option registered in one stack, in registration order.
///
/// Options whose name collides with an earlier registration are kept but
/// disabled: the remote side may load plugins in a different order and
/// matches options by plugin and name.
#[derive(Debug)]
pub struct OptionRegistry {
    opts: Vec<PluginOpt>,
    next_optval: c_int,
}

impl Default for OptionRegistry {
    fn default() -> Self {
        OptionRegistry {
            opts: Vec::new(),
            next_optval: SPANK_OPTVAL_BASE,
        }
    }
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.opts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.opts.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &PluginOpt> {
        self.opts.iter()
    }
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PluginOpt> {
        self.opts.iter_mut()
    }

    fn next_optval(&mut self) -> c_int {
        let val = self.next_optval;
        self.next_optval += 1;
        val
    }

    fn push(&mut self, plugin: usize, plugin_name: &str, opt: &SpankOption, disabled: bool) {
        let optval = self.next_optval();
        self.opts.push(PluginOpt {
            opt: opt.clone(),
            plugin,
            plugin_name: plugin_name.to_string(),
            optval,
            found: false,
            disabled,
            optarg: None,
            c_optarg: None,
            set: false,
            set_by_env: false,
        });
    }

    /// Registers `opt` on behalf of plugin number `plugin`.
    pub fn register(
        &mut self,
        plugin: usize,
        plugin_name: &str,
        opt: &SpankOption,
    ) -> Result<(), OptionError> {
        let mut disabled = false;
        if let Some(other) = self.find_by_name(&opt.name) {
            info!(
                "spank: option \"{}\" provided by both {} and {}",
                opt.name, plugin_name, other.plugin_name
            );
            disabled = true;
        }

        if opt.name.len() > SPANK_OPTION_MAXLEN {
            error!(
                "spank: option \"{}\" provided by {} too long. Ignoring.",
                opt.name, plugin_name
            );
            return Err(OptionError::NameTooLong(opt.name.clone()));
        }

        debug!("SPANK: appending plugin option \"{}\"", opt.name);
        self.push(plugin, plugin_name, opt, disabled);
        Ok(())
    }

    /// Caches the result of an environment lookup made by `getopt`.
    pub(crate) fn cache(
        &mut self,
        plugin: usize,
        plugin_name: &str,
        opt: &SpankOption,
        optarg: Option<String>,
    ) -> &PluginOpt {
        self.push(plugin, plugin_name, opt, false);
        let cached = self.opts.len() - 1;
        let entry = &mut self.opts[cached];
        if let Some(arg) = optarg {
            entry.optarg = Some(arg);
            entry.found = true;
        }
        entry
    }

    pub fn find_by_val(&self, optval: c_int) -> Option<&PluginOpt> {
        self.opts.iter().find(|o| o.optval == optval)
    }

    /// First registration of `name`, disabled or not.
    pub fn find_by_name(&self, name: &str) -> Option<&PluginOpt> {
        self.opts.iter().find(|o| o.opt.name == name)
    }

    /// Value of the first registration of `name` as a C string. It stays
    /// valid until the value changes or the registry goes away.
    pub(crate) fn optarg_c_str(&mut self, name: &str) -> Option<&CStr> {
        let opt = self.opts.iter_mut().find(|o| o.opt.name == name)?;
        if opt.c_optarg.is_none() {
            opt.c_optarg = opt.optarg.as_deref().and_then(|a| CString::new(a).ok());
        }
        opt.c_optarg.as_deref()
    }

    pub fn find(&self, plugin_name: &str, name: &str) -> Option<&PluginOpt> {
        self.opts
            .iter()
            .find(|o| o.plugin_name == plugin_name && o.opt.name == name)
    }

    pub(crate) fn find_mut(&mut self, plugin_name: &str, name: &str) -> Option<&mut PluginOpt> {
        self.opts
            .iter_mut()
            .find(|o| o.plugin_name == plugin_name && o.opt.name == name)
    }

    /// Looks an option up by its `plugin:option` key.
    pub fn find_by_declared_name(&mut self, key: &str) -> Option<&mut PluginOpt> {
        let (plugin_name, name) = match key.split_once(':') {
            Some(parts) => parts,
            None => {
                warn!("Malformed plugin option \"{}\" received. Ignoring", key);
                return None;
            }
        };

        let found = self.find_mut(plugin_name, name);
        if found.is_none() {
            warn!(
                "SPANK plugin \"{}\" option \"{}\" not found",
                plugin_name, name
            );
        }
        found
    }

    /// Feeds a command line value to the option registered under `optval`.
    pub fn process_value(&mut self, optval: c_int, arg: Option<&str>) -> Result<(), OptionError> {
        if self.opts.is_empty() {
            debug!("No spank option cache");
            return Err(OptionError::NoCache);
        }

        let opt = match self.opts.iter_mut().find(|o| o.optval == optval) {
            Some(opt) => opt,
            None => {
                error!("Failed to find spank option for optval: {}", optval);
                return Err(OptionError::UnknownValue(optval));
            }
        };

        opt.apply(arg, false).map_err(|rc| {
            error!("Invalid --{} argument: {}", opt.opt.name, arg.unwrap_or(""));
            OptionError::Rejected {
                name: opt.opt.name.clone(),
                arg: arg.unwrap_or("").to_string(),
                rc,
            }
        })
    }

    /// Appends every enabled option to `builtin`. Options clashing with an
    /// entry already in the table are disabled.
    pub fn table_create(&mut self, builtin: &[CliOption]) -> Vec<CliOption> {
        let mut table = builtin.to_vec();

        for opt in self.opts.iter_mut().filter(|o| !o.disabled) {
            if table.iter().any(|t| t.name == opt.opt.name) {
                error!(
                    "Ignoring conflicting option \"{}\" in plugin \"{}\"",
                    opt.opt.name, opt.plugin_name
                );
                opt.disabled = true;
                continue;
            }
            table.push(CliOption::new(&opt.opt.name, opt.opt.has_arg, opt.optval));
        }

        table
    }

    /// Writes the plugin section of `--help`.
    pub fn print<W: Write>(&self, w: &mut W, left_pad: usize, width: usize) -> io::Result<()> {
        if self.opts.is_empty() {
            return Ok(());
        }

        writeln!(w, "\nOptions provided by plugins:")?;
        let columns = term_columns();
        for opt in self.opts.iter().filter(|o| !o.disabled) {
            print_option(w, &opt.opt, left_pad, width, columns)?;
        }
        Ok(())
    }

    pub fn plugin_option_names(&self, plugin_name: &str) -> Vec<String> {
        self.opts
            .iter()
            .filter(|o| !o.disabled && o.plugin_name == plugin_name)
            .map(|o| o.opt.name.clone())
            .collect()
    }

    /// Value of option `name`: its argument, `"set"` or `"unset"`.
    pub fn option_get(&self, name: &str) -> Option<String> {
        self.find_by_name(name).and_then(PluginOpt::display_value)
    }

    pub fn option_plugin(&self, name: &str) -> Option<String> {
        self.find_by_name(name).map(|o| o.plugin_name.clone())
    }

    pub fn option_isset(&self, name: &str) -> bool {
        self.find_by_name(name).map_or(false, |o| o.set)
    }

    /// `(plugin, option, value)` for every option set so far.
    pub fn options_set(&self) -> Vec<(String, String, String)> {
        self.opts
            .iter()
            .filter(|o| o.set)
            .map(|o| {
                (
                    o.plugin_name.clone(),
                    o.opt.name.clone(),
                    o.display_value().unwrap_or_default(),
                )
            })
            .collect()
    }
}

fn term_columns() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(80)
}

fn print_option<W: Write>(
    w: &mut W,
    opt: &SpankOption,
    left_pad: usize,
    width: usize,
    columns: usize,
) -> io::Result<()> {
    let (equals, arginfo) = match &opt.arginfo {
        Some(info) => ("=", info.as_str()),
        None => ("", ""),
    };

    let mut info = format!("{:pad$}--{}{}{}", "", opt.name, equals, arginfo, pad = left_pad);
    if info.chars().count() > columns {
        info = info.chars().take(columns.saturating_sub(2)).collect();
        info.push('+');
    }

    let lines = wrap_usage(opt.usage.as_deref().unwrap_or(""), columns.saturating_sub(width));
    let first = lines.first().map(String::as_str).unwrap_or("");

    if info.chars().count() < width {
        writeln!(w, "{:<width$}{}", info, first, width = width)?;
    } else {
        writeln!(w, "\n{}\n{:width$}{}", info, "", first, width = width)?;
    }

    for line in lines.iter().skip(1) {
        writeln!(w, "{:width$}{}", "", line, width = width)?;
    }
    Ok(())
}

/// Splits `text` into lines of at most `width` characters, breaking at
/// whitespace and hyphenating words longer than a line.
fn wrap_usage(text: &str, width: usize) -> Vec<String> {
    let width = width.max(2);
    let chars: Vec<char> = text.chars().collect();
    let mut lines = Vec::new();

    let mut start = 0;
    while start < chars.len() && chars[start].is_whitespace() {
        start += 1;
    }

    while start < chars.len() {
        let rest = &chars[start..];
        if rest.len() <= width {
            lines.push(rest.iter().collect());
            break;
        }

        match rest[..=width].iter().rposition(|c| c.is_whitespace()) {
            Some(pos) if pos > 0 => {
                let seg: String = rest[..pos].iter().collect();
                lines.push(seg.trim_end().to_string());
                start += pos;
                while start < chars.len() && chars[start].is_whitespace() {
                    start += 1;
                }
            }
            _ => {
                let mut seg: String = rest[..width - 1].iter().collect();
                seg.push('-');
                lines.push(seg);
                start += width - 1;
            }
        }
    }

    lines
}
