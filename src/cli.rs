//! Command-line arguments and the interactive command grammar

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Settings;
use crate::pathmap::CaseSensitivity;

/// Process arguments
#[derive(Clone, Debug, Parser)]
#[command(
    author,
    version,
    about = "treemirror - keep live one-way mirrors of directory trees"
)]
pub struct Args {
    /// Settings file (default: <config dir>/treemirror.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append a journal of every mirrored change to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// How mirror roots are compared
    #[arg(long, value_enum)]
    pub case_sensitivity: Option<CaseSensitivity>,

    /// Event lanes per mirror (0 = auto)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

impl Args {
    /// Flags win over the settings file.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(ref p) = self.log_file {
            settings.log_file = Some(p.clone());
        }
        if let Some(c) = self.case_sensitivity {
            settings.case_sensitivity = c;
        }
        if let Some(w) = self.workers {
            settings.workers = w;
        }
    }
}

/// One line typed at the prompt
#[derive(Clone, Debug, Parser)]
#[command(no_binary_name = true, disable_version_flag = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Start mirroring a source into one or more targets
    Add {
        source: PathBuf,
        #[arg(required = true, num_args = 1..)]
        targets: Vec<PathBuf>,
    },
    /// Stop mirroring a source into the given targets
    End {
        source: PathBuf,
        #[arg(required = true, num_args = 1..)]
        targets: Vec<PathBuf>,
    },
    /// Show active mirrors
    List,
    /// Make a source identical to one of its backups
    Restore { source: PathBuf, backup: PathBuf },
    /// Stop every mirror and leave
    #[command(alias = "quit")]
    Exit,
}

/// Split a command line into words. Single or double quotes group words
/// containing spaces; the quotes themselves are dropped.
pub fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {q} quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Parse a prompt line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let words = split_line(line)?;
    if words.is_empty() {
        return Ok(None);
    }
    ShellLine::try_parse_from(words)
        .map(|l| Some(l.command))
        .map_err(|e| e.to_string())
}
