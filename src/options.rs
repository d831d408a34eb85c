//! Parsing Options.
//! `--ignore-list {file}` or `-i`, may be repeated; entries are merged.
//! `--no-assume-safe-malloc`, allocation and free calls may race.
//! `--keep-termination-calls`, check calls in blocks ending in `unreachable`.
//! `--max-uses-to-explore {n}`, bound the uses visited by capture queries.
//! `--format {text|json}` or `-f`, the output format, text by default.
//! The positional argument is the subject file to analyze.
use clap::{Arg, Command};
use std::error::Error;
use std::path::PathBuf;

use crate::config::AnalysisConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Text
    }
}

fn make_options_parser<'help>() -> Command<'help> {
    let parser = Command::new("RACEBUD")
        .no_binary_name(true)
        .version("v0.1.0")
        .arg(
            Arg::new("ignore")
                .short('i')
                .long("ignore-list")
                .takes_value(true)
                .multiple_occurrences(true)
                .help("A list of functions, globals, types and modules not to check"),
        )
        .arg(
            Arg::new("unsafe_malloc")
                .long("no-assume-safe-malloc")
                .takes_value(false)
                .help("Do not assume that allocation and free calls are race free"),
        )
        .arg(
            Arg::new("termination")
                .long("keep-termination-calls")
                .takes_value(false)
                .help("Check calls in blocks that end the program"),
        )
        .arg(
            Arg::new("max_uses")
                .long("max-uses-to-explore")
                .takes_value(true)
                .help("The number of uses a capture query visits before giving up"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .takes_value(true)
                .possible_values(["text", "json"])
                .help("The output format, text by default"),
        )
        .arg(
            Arg::new("input")
                .takes_value(true)
                .help("The subject to analyze in JSON"),
        );
    parser
}

#[derive(Debug)]
pub struct Options {
    pub ignore_lists: Vec<PathBuf>,
    pub assume_safe_malloc: bool,
    pub ignore_termination_calls: bool,
    pub max_uses_to_explore: Option<usize>,
    /// `None` until given on some source, so that a later source can override it.
    pub format: Option<OutputFormat>,
    pub input: Option<PathBuf>,
}

impl Options {
    pub fn parse_from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        let flags = shellwords::split(s)?;
        Self::parse_from_args(&flags)
    }

    pub fn parse_from_args(flags: &[String]) -> Result<Self, Box<dyn Error>> {
        let app = make_options_parser();
        let matches = app.try_get_matches_from(flags.iter())?;
        let format = match matches.value_of("format") {
            Some("text") => Some(OutputFormat::Text),
            Some("json") => Some(OutputFormat::Json),
            Some(_) => return Err("UnsupportedFormat")?,
            None => None,
        };
        let ignore_lists = matches
            .values_of("ignore")
            .map(|paths| paths.map(PathBuf::from).collect())
            .unwrap_or_default();
        let max_uses_to_explore = match matches.value_of("max_uses") {
            Some(n) => Some(n.parse::<usize>()?),
            None => None,
        };
        Ok(Options {
            ignore_lists,
            assume_safe_malloc: !matches.is_present("unsafe_malloc"),
            ignore_termination_calls: !matches.is_present("termination"),
            max_uses_to_explore,
            format,
            input: matches.value_of("input").map(PathBuf::from),
        })
    }

    /// Append the flags of `other`, given on a later source such as the command line
    /// after the env var. Values set on the later source win.
    pub fn merge(mut self, other: Options) -> Self {
        self.ignore_lists.extend(other.ignore_lists);
        self.assume_safe_malloc &= other.assume_safe_malloc;
        self.ignore_termination_calls &= other.ignore_termination_calls;
        self.max_uses_to_explore = other.max_uses_to_explore.or(self.max_uses_to_explore);
        self.format = other.format.or(self.format);
        self.input = other.input.or(self.input);
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format.unwrap_or_default()
    }

    pub fn to_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            assume_safe_malloc: self.assume_safe_malloc,
            ignore_termination_calls: self.ignore_termination_calls,
            max_uses_to_explore: self.max_uses_to_explore,
        }
    }
}
