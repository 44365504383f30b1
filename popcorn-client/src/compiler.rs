//! Compiler command-line handling
//!
//! The driver's own argv is a compiler invocation. [`LocalCompiler`] scans
//! it once: it pulls out the source file, the output object and every
//! include directory, keeps the rest verbatim for the remote side, and
//! decides whether the invocation is remote-safe at all. Flags that bind
//! the build to this machine (`=native` values, sysroot overrides) force a
//! local build.
//!
//! Input enumeration drives the real compiler in list-only mode
//! (`-M -Wp,-v`): dependency output enumerates every file the translation
//! unit reads, stderr carries the include search list the preprocessor
//! actually used.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

const SOURCE_SUFFIXES: [&str; 4] = [".cpp", ".cc", ".cxx", ".c"];

fn is_source_file(arg: &str) -> bool {
    SOURCE_SUFFIXES.iter().any(|suffix| arg.ends_with(suffix))
}

fn absolute(path: &str) -> String {
    std::path::absolute(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Resolve symlinks, absolutize and dedupe, preserving first-seen order
pub fn normalize_paths(paths: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(paths.len());
    let mut result = Vec::with_capacity(paths.len());
    for path in paths {
        let resolved = std::fs::canonicalize(&path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| absolute(&path));
        if seen.insert(resolved.clone()) {
            result.push(resolved);
        }
    }
    result
}

/// One parsed compiler invocation
#[derive(Debug)]
pub struct LocalCompiler {
    /// Compiler executable name
    pub name: String,
    /// Absolute path of the single input source
    pub in_file: String,
    /// Absolute path of the output object
    pub out_file: String,
    /// True when nothing in argv forces a local build
    pub remote_allowed: bool,
    remote_args: Vec<String>,
    dirs_iquote: Vec<String>,
    dirs_i: Vec<String>,
    dirs_isystem: Vec<String>,
    include_files: Vec<String>,
    local_args: Vec<String>,
}

impl LocalCompiler {
    /// Scan a compiler command line (`argv[0]` is the compiler itself)
    pub fn new(argv: &[String]) -> Self {
        let mut compiler = Self {
            name: argv.first().cloned().unwrap_or_default(),
            in_file: String::new(),
            out_file: String::new(),
            remote_allowed: true,
            remote_args: Vec::new(),
            dirs_iquote: Vec::new(),
            dirs_i: Vec::new(),
            dirs_isystem: Vec::new(),
            include_files: Vec::new(),
            local_args: argv.get(1..).unwrap_or_default().to_vec(),
        };
        compiler.scan(argv);
        compiler.remote_allowed = compiler.remote_allowed
            && !compiler.in_file.is_empty()
            && compiler.out_file.ends_with(".o");
        compiler
    }

    #[allow(clippy::too_many_lines)]
    fn scan(&mut self, argv: &[String]) {
        let mut i = 1;
        while i < argv.len() {
            let arg = &argv[i];
            i += 1;
            if arg.is_empty() {
                continue;
            }
            if let Some(rest) = arg.strip_prefix('-') {
                match rest {
                    "o" => {
                        if let Some(out) = argv.get(i) {
                            self.out_file = absolute(out);
                            i += 1;
                        } else {
                            self.remote_allowed = false;
                        }
                        continue;
                    }
                    "I" => {
                        if let Some(dir) = argv.get(i) {
                            self.dirs_i.push(dir.clone());
                            i += 1;
                        } else {
                            self.remote_allowed = false;
                        }
                        continue;
                    }
                    "iquote" => {
                        if let Some(dir) = argv.get(i) {
                            self.dirs_iquote.push(dir.clone());
                            i += 1;
                        } else {
                            self.remote_allowed = false;
                        }
                        continue;
                    }
                    "isystem" => {
                        if let Some(dir) = argv.get(i) {
                            self.dirs_isystem.push(dir.clone());
                            i += 1;
                        } else {
                            self.remote_allowed = false;
                        }
                        continue;
                    }
                    "include" => {
                        if let Some(file) = argv.get(i) {
                            self.include_files.push(file.clone());
                            self.remote_args.push(arg.clone());
                            self.remote_args.push(file.clone());
                            i += 1;
                        } else {
                            self.remote_allowed = false;
                        }
                        continue;
                    }
                    _ => {}
                }
                if let Some(out) = rest.strip_prefix('o') {
                    self.out_file = absolute(out);
                    continue;
                }
                if arg.ends_with("=native")
                    || arg == "-I-"
                    || arg.starts_with("-idirafter")
                    || arg.starts_with("--sysroot")
                    || arg.starts_with("-isysroot")
                {
                    // These bind the build to the local machine.
                    self.remote_allowed = false;
                } else if let Some(dir) = arg.strip_prefix("-iquote") {
                    self.dirs_iquote.push(dir.to_string());
                    continue;
                } else if let Some(dir) = arg.strip_prefix("-isystem") {
                    self.dirs_isystem.push(dir.to_string());
                    continue;
                } else if let Some(dir) = arg.strip_prefix("-I") {
                    self.dirs_i.push(dir.to_string());
                    continue;
                }
            } else if is_source_file(arg) {
                if !self.in_file.is_empty() {
                    self.remote_allowed = false;
                }
                self.in_file = absolute(arg);
                continue;
            }
            self.remote_args.push(arg.clone());
        }
    }

    /// Argv for the remote side: normalized include dirs first, then the
    /// untouched remainder, then `extra`
    pub fn make_remote_args(&mut self, extra: &[&str]) -> Vec<String> {
        self.dirs_iquote = normalize_paths(std::mem::take(&mut self.dirs_iquote));
        self.dirs_i = normalize_paths(std::mem::take(&mut self.dirs_i));
        self.dirs_isystem = normalize_paths(std::mem::take(&mut self.dirs_isystem));

        let mut args = Vec::with_capacity(
            2 * (self.dirs_iquote.len() + self.dirs_i.len() + self.dirs_isystem.len())
                + self.remote_args.len()
                + extra.len(),
        );
        for dir in &self.dirs_iquote {
            args.push("-iquote".to_string());
            args.push(dir.clone());
        }
        for dir in &self.dirs_i {
            args.push("-I".to_string());
            args.push(dir.clone());
        }
        for dir in &self.dirs_isystem {
            args.push("-isystem".to_string());
            args.push(dir.clone());
        }
        args.extend(self.remote_args.iter().cloned());
        args.extend(extra.iter().map(ToString::to_string));
        args
    }

    /// Enumerate every file the translation unit reads, updating the
    /// include-dir lists from the preprocessor's actual search list.
    /// Returns absolute, deduped paths with the source file last.
    pub async fn enumerate_inputs(&mut self) -> Result<Vec<String>> {
        let in_file = self.in_file.clone();
        let args = self.make_remote_args(&[in_file.as_str(), "-o", "/dev/stdout", "-M", "-Wp,-v"]);
        debug!("Enumerating inputs: {} -M", self.name);
        let output = Command::new(&self.name).args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::InputEnumeration(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        self.add_include_dirs_from(&String::from_utf8_lossy(&output.stderr));

        let mut inputs = extract_dependencies(&String::from_utf8_lossy(&output.stdout));
        for include in &self.include_files {
            for companion in pch_companions(include) {
                if companion.exists() {
                    inputs.push(companion.to_string_lossy().into_owned());
                }
            }
        }
        let mut inputs = normalize_paths(inputs);
        inputs.push(self.in_file.clone());
        Ok(inputs)
    }

    /// Fold the preprocessor's include search list back into the dir sets.
    /// Search dirs under `/usr/` count as system dirs.
    fn add_include_dirs_from(&mut self, stderr: &str) {
        const IQUOTE_START: &str = "#include \"...\"";
        const I_START: &str = "#include <...>";
        const SEARCH_END: &str = "End of search list";

        #[derive(PartialEq)]
        enum Bucket {
            None,
            Iquote,
            I,
        }

        let mut bucket = Bucket::None;
        for line in stderr.lines() {
            let line = line.trim();
            if line.starts_with(IQUOTE_START) {
                bucket = Bucket::Iquote;
            } else if line.starts_with(I_START) {
                bucket = Bucket::I;
            } else if line.starts_with(SEARCH_END) {
                return;
            } else if line.starts_with('/') {
                match bucket {
                    Bucket::Iquote => self.dirs_iquote.push(line.to_string()),
                    Bucket::I => {
                        if line.starts_with("/usr/") {
                            self.dirs_isystem.push(line.to_string());
                        } else {
                            self.dirs_i.push(line.to_string());
                        }
                    }
                    Bucket::None => {}
                }
            }
        }
    }

    /// Run the original command line locally
    pub async fn compile_locally(&self) -> (i32, Vec<u8>, Vec<u8>) {
        debug!("Compiling locally: {} {:?}", self.name, self.local_args);
        match Command::new(&self.name)
            .args(&self.local_args)
            .output()
            .await
        {
            Ok(output) => (
                output.status.code().unwrap_or(-1),
                output.stdout,
                output.stderr,
            ),
            Err(e) => (
                1,
                Vec::new(),
                format!("Can't run compiler {}: {e}\n", self.name).into_bytes(),
            ),
        }
    }
}

/// Parse `-M` dependency output into the list of files it names. Handles
/// line continuations, skips the rule target, and honors
/// `#pragma GCC pch_preprocess "file"` markers.
fn extract_dependencies(stdout: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut words = stdout.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if word == "#pragma" {
            let is_pch_marker =
                words.next_if_eq(&"GCC").is_some() && words.next_if_eq(&"pch_preprocess").is_some();
            if is_pch_marker {
                if let Some(file) = words.next() {
                    files.push(file.trim_matches('"').to_string());
                }
            }
            continue;
        }
        if word == "\\"
            || is_source_file(word)
            || word.ends_with(".o")
            || word.ends_with(".o:")
        {
            continue;
        }
        files.push(word.to_string());
    }
    files
}

/// `.gch`/`.pch` companion paths of `-include` arguments, for callers that
/// need them without a full enumeration
pub fn pch_companions(include_file: &str) -> [PathBuf; 2] {
    [
        PathBuf::from(format!("{include_file}.gch")),
        PathBuf::from(format!("{include_file}.pch")),
    ]
}
