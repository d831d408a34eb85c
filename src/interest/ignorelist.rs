//! Lists of functions, globals, struct types and source modules whose accesses are not checked.
//! The format is the one of special-case lists:
//! ```text
//! # comment
//! [cilk]
//! fun:__kmpc_*
//! global:counter=hot
//! src:*/vendor/*
//! ```
//! Section headers and entry patterns are globs. Entries before any header
//! belong to the section `*`. An entry without `=category` has the empty category.
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// The section queried by the detector.
pub const SECTION: &str = "cilk";

#[derive(Debug, Error)]
pub enum IgnoreListError {
    #[error("cannot read ignore list {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("line {line}: malformed entry `{text}`, expected `prefix:pattern[=category]`")]
    Malformed { line: usize, text: String },

    #[error("line {line}: unterminated section header `{text}`")]
    BadSection { line: usize, text: String },

    #[error("line {line}: invalid pattern `{pattern}`: {source}")]
    BadPattern {
        line: usize,
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug)]
struct Section {
    matcher: Regex,
    /// (prefix, category) -> patterns
    entries: FxHashMap<(String, String), Vec<Regex>>,
}

#[derive(Debug, Default)]
pub struct IgnoreList {
    sections: Vec<Section>,
}

/// Translate a glob into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
    let mut re = String::with_capacity(glob.len() + 2);
    re.push('^');
    let mut in_class = false;
    for c in glob.chars() {
        match c {
            '*' if !in_class => re.push_str(".*"),
            '?' if !in_class => re.push('.'),
            '[' if !in_class => {
                in_class = true;
                re.push('[');
            }
            ']' if in_class => {
                in_class = false;
                re.push(']');
            }
            '!' if in_class && re.ends_with('[') => re.push('^'),
            '\\' if in_class => re.push_str("\\\\"),
            _ if in_class => re.push(c),
            _ => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

fn compile(pattern: &str, line: usize) -> Result<Regex, IgnoreListError> {
    Regex::new(&glob_to_regex(pattern)).map_err(|source| IgnoreListError::BadPattern {
        line,
        pattern: pattern.to_owned(),
        source,
    })
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, IgnoreListError> {
        let mut list = Self::new();
        list.extend_from_str(text)?;
        Ok(list)
    }

    /// Read and merge several lists.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, IgnoreListError> {
        let mut list = Self::new();
        for path in paths {
            let path = path.as_ref();
            let text = fs::read_to_string(path).map_err(|source| IgnoreListError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            list.extend_from_str(&text)?;
        }
        Ok(list)
    }

    fn extend_from_str(&mut self, text: &str) -> Result<(), IgnoreListError> {
        let mut current = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            if let Some(header) = text.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| IgnoreListError::BadSection {
                    line,
                    text: text.to_owned(),
                })?;
                self.sections.push(Section {
                    matcher: compile(name, line)?,
                    entries: FxHashMap::default(),
                });
                current = Some(self.sections.len() - 1);
                continue;
            }
            let (prefix, rest) = text.split_once(':').ok_or_else(|| IgnoreListError::Malformed {
                line,
                text: text.to_owned(),
            })?;
            let (pattern, category) = rest.split_once('=').unwrap_or((rest, ""));
            if prefix.is_empty() || pattern.is_empty() {
                return Err(IgnoreListError::Malformed {
                    line,
                    text: text.to_owned(),
                });
            }
            let regex = compile(pattern, line)?;
            let section = match current {
                Some(section) => section,
                None => {
                    self.sections.push(Section {
                        matcher: compile("*", line)?,
                        entries: FxHashMap::default(),
                    });
                    let section = self.sections.len() - 1;
                    current = Some(section);
                    section
                }
            };
            self.sections[section]
                .entries
                .entry((prefix.to_owned(), category.to_owned()))
                .or_default()
                .push(regex);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.entries.is_empty())
    }

    /// Whether `query` matches an entry `prefix:...=category` of a section matching `section`.
    pub fn in_section(&self, section: &str, prefix: &str, query: &str, category: &str) -> bool {
        let key = (prefix.to_owned(), category.to_owned());
        self.sections
            .iter()
            .filter(|s| s.matcher.is_match(section))
            .filter_map(|s| s.entries.get(&key))
            .flatten()
            .any(|re| re.is_match(query))
    }

    /// Whether the source module is listed.
    pub fn is_module_listed(&self, module: &str) -> bool {
        self.in_section(SECTION, "src", module, "")
    }

    /// Whether the function or its source module is listed.
    pub fn is_function_listed(&self, name: &str, module: &str) -> bool {
        self.is_module_listed(module) || self.in_section(SECTION, "fun", name, "")
    }

    /// Whether the global or its source module is listed.
    pub fn is_global_listed(&self, name: &str, module: &str) -> bool {
        self.is_module_listed(module) || self.in_section(SECTION, "global", name, "")
    }

    /// Whether the named struct type is listed.
    pub fn is_type_listed(&self, name: &str) -> bool {
        self.in_section(SECTION, "type", name, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("a*b?"), "^a.*b.$");
        assert_eq!(glob_to_regex("x.y"), "^x\\.y$");
        assert_eq!(glob_to_regex("[!ab]c"), "^[^ab]c$");
    }

    #[test]
    fn test_parse_and_query() {
        let list = IgnoreList::parse(
            "# runtime functions\n\
             fun:__kmpc_*\n\
             [cilk]\n\
             global:counter\n\
             global:hot_*=hot\n\
             type:struct.Lock*\n\
             [other]\n\
             fun:memcpy\n",
        )
        .unwrap();
        assert!(list.is_function_listed("__kmpc_fork", "m.c"));
        assert!(!list.is_function_listed("memcpy", "m.c"));
        assert!(list.is_global_listed("counter", "m.c"));
        assert!(!list.is_global_listed("hot_x", "m.c"));
        assert!(list.in_section(SECTION, "global", "hot_x", "hot"));
        assert!(list.is_type_listed("struct.LockGuard"));
        assert!(list.in_section("other", "fun", "memcpy", ""));
        assert!(!list.is_empty());
        assert!(IgnoreList::new().is_empty());
    }

    #[test]
    fn test_module_listed() {
        let list = IgnoreList::parse("[c*]\nsrc:*/vendor/*\n").unwrap();
        assert!(list.is_function_listed("f", "lib/vendor/x.c"));
        assert!(list.is_global_listed("g", "lib/vendor/x.c"));
        assert!(!list.is_function_listed("f", "lib/x.c"));
    }

    #[test]
    fn test_parse_errors() {
        match IgnoreList::parse("fun:ok\nnot an entry\n") {
            Err(IgnoreListError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        match IgnoreList::parse("[cilk\n") {
            Err(IgnoreListError::BadSection { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            IgnoreList::parse("fun:[a\n"),
            Err(IgnoreListError::BadPattern { line: 1, .. })
        ));
        assert!(matches!(
            IgnoreList::from_files(&["/nonexistent/ignore.txt"]),
            Err(IgnoreListError::Io { .. })
        ));
    }
}
