//! `plugstack.conf` line grammar.
//!
//! ```text
//! required /usr/lib/slurm/renice.so min_prio=-10
//! optional lua.so       # trailing comments are ignored
//! include /etc/slurm/plugstack.conf.d/*.conf
//! ```

use std::str::FromStr;
use thiserror::Error;

const SEPARATORS: &[char] = &[' ', '\t', '\n'];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirectiveKind {
    Required,
    Optional,
    Include,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid plugstack directive: {0}")]
pub struct InvalidDirective(pub String);

impl FromStr for DirectiveKind {
    type Err = InvalidDirective;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "required" => Ok(DirectiveKind::Required),
            "optional" => Ok(DirectiveKind::Optional),
            "include" => Ok(DirectiveKind::Include),
            _ => Err(InvalidDirective(s.to_string())),
        }
    }
}

/// One meaningful line of a stack file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    /// Plugin path, or glob pattern for includes.
    pub path: Option<String>,
    pub args: Vec<String>,
}

/// Parses one line. Blank and comment-only lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Directive>, InvalidDirective> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };

    let mut words = line.split(SEPARATORS).filter(|w| !w.is_empty());
    let kind = match words.next() {
        Some(word) => word.parse::<DirectiveKind>()?,
        None => return Ok(None),
    };

    Ok(Some(Directive {
        kind,
        path: words.next().map(str::to_string),
        args: words.map(str::to_string).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_lines_keep_their_arguments() {
        let d = parse_line("required\t/lib/renice.so  min_prio=-10 x # comment\n")
            .unwrap()
            .unwrap();
        assert_eq!(d.kind, DirectiveKind::Required);
        assert_eq!(d.path.as_deref(), Some("/lib/renice.so"));
        assert_eq!(d.args, vec!["min_prio=-10", "x"]);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   \t\n"), Ok(None));
        assert_eq!(parse_line("# required /lib/x.so"), Ok(None));
    }

    #[test]
    fn unknown_keywords_are_invalid() {
        assert_eq!(
            parse_line("mandatory /lib/x.so"),
            Err(InvalidDirective("mandatory".to_string()))
        );
    }

    #[test]
    fn include_without_pattern_parses() {
        let d = parse_line("include").unwrap().unwrap();
        assert_eq!(d.kind, DirectiveKind::Include);
        assert_eq!(d.path, None);
        assert!(d.args.is_empty());
    }
}
