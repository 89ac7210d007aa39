//! Code for figuring out what input files we need to read then mapping them
//! into memory. Linker scripts encountered here are parsed immediately: their
//! contributed inputs are spliced into the load order at the script's
//! position and their symbol assignments are collected for the pipeline.

use crate::args::Args;
use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::linker_script;
use crate::linker_script::Assignment;
use crate::linker_script::Command;
use anyhow::anyhow;
use anyhow::bail;
use hashbrown::HashSet;
use memmap2::Mmap;
use std::path::Path;
use std::path::PathBuf;

pub struct InputSequence {
    pub(crate) files: Vec<LoadedFile>,

    /// Indices into `files` of the objects, shared objects and archives in
    /// link order.
    pub(crate) order: Vec<usize>,

    pub(crate) script: ScriptUniverse,
}

/// Script-contributed state that outlives loading.
#[derive(Default)]
pub(crate) struct ScriptUniverse {
    pub(crate) entry: Option<String>,
    pub(crate) assignments: Vec<Assignment>,
    pub(crate) output_arch: Option<String>,
}

pub(crate) struct LoadedFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    pub(crate) modifiers: Modifiers,
    bytes: Option<Mmap>,
}

impl LoadedFile {
    pub(crate) fn data(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or_default()
    }
}

impl std::fmt::Display for LoadedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filename.display())
    }
}

#[tracing::instrument(skip_all, name = "Load inputs")]
pub(crate) fn load_inputs(args: &Args) -> Result<InputSequence> {
    let mut loader = Loader {
        files: Vec::new(),
        order: Vec::new(),
        script: ScriptUniverse::default(),
        search_path: args.lib_search_path.iter().map(|p| p.to_path_buf()).collect(),
        sysroot: args.sysroot.as_deref().map(Path::to_path_buf),
        seen_paths: HashSet::new(),
    };

    for input in &args.inputs {
        loader.process_input(input)?;
    }

    Ok(InputSequence {
        files: loader.files,
        order: loader.order,
        script: loader.script,
    })
}

struct Loader {
    files: Vec<LoadedFile>,
    order: Vec<usize>,
    script: ScriptUniverse,
    search_path: Vec<PathBuf>,
    sysroot: Option<PathBuf>,
    seen_paths: HashSet<PathBuf>,
}

impl Loader {
    fn process_input(&mut self, input: &Input) -> Result {
        let path = self.resolve(input)?;
        if !self.seen_paths.insert(path.clone()) {
            // A file that's already part of the link contributes nothing new.
            return Ok(());
        }

        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;
        let metadata = file.metadata()?;
        let bytes = if metadata.len() == 0 {
            None
        } else {
            // Safety: the file is expected not to change while we're linking.
            Some(unsafe { Mmap::map(&file) }.with_context(|| {
                format!("Failed to mmap input file `{}`", path.display())
            })?)
        };

        let kind = FileKind::identify_bytes(bytes.as_deref().unwrap_or_default())
            .map_err(|_| {
                anyhow!(LinkError::UnrecognizedInput(path.display().to_string()))
            })?;

        let loaded = LoadedFile {
            filename: path.clone(),
            kind,
            modifiers: input.modifiers,
            bytes,
        };

        if kind == FileKind::Text {
            let text = std::str::from_utf8(loaded.data())
                .with_context(|| format!("Linker script `{}` is not UTF-8", path.display()))?
                .to_owned();
            self.files.push(loaded);
            self.process_script(&text, &path, input.modifiers)
                .with_context(|| format!("Failed to parse linker script `{}`", path.display()))?;
        } else {
            let index = self.files.len();
            self.files.push(loaded);
            self.order.push(index);
        }
        Ok(())
    }

    fn process_script(&mut self, text: &str, path: &Path, modifiers: Modifiers) -> Result {
        let script = linker_script::parse_script(text)?;
        let script_dir = path.parent().map(Path::to_path_buf);
        for command in script.commands {
            match command {
                Command::Inputs(requests) => {
                    for request in requests {
                        let spec = self.maybe_apply_sysroot(path, request.spec);
                        let sub_modifiers = Modifiers {
                            as_needed: modifiers.as_needed || request.as_needed,
                            ..modifiers
                        };
                        self.process_input(&Input {
                            spec,
                            search_first: script_dir.clone(),
                            modifiers: sub_modifiers,
                        })?;
                    }
                }
                Command::Entry(name) => {
                    // The -e flag wins over ENTRY(); a later script wins over
                    // an earlier one, matching observed GNU behaviour.
                    self.script.entry = Some(name);
                }
                Command::SearchDir(dir) => self.search_path.push(dir),
                Command::OutputArch(name) => self.script.output_arch = Some(name),
                Command::OutputFormat(_) => {}
                Command::Assignment(assignment) => self.script.assignments.push(assignment),
            }
        }
        Ok(())
    }

    /// Rewrites a script-referenced absolute path to live under the sysroot
    /// when the script itself came from the sysroot, or when the path is
    /// explicitly marked with `=` / `$SYSROOT`.
    fn maybe_apply_sysroot(&self, script_path: &Path, spec: InputSpec) -> InputSpec {
        let Some(sysroot) = self.sysroot.as_deref() else {
            return spec;
        };
        let InputSpec::File(file) = &spec else {
            return spec;
        };
        if let Ok(stripped) = file.strip_prefix("=").or_else(|_| file.strip_prefix("$SYSROOT")) {
            return InputSpec::File(Box::from(sysroot.join(stripped)));
        }
        if script_path.starts_with(sysroot) && file.is_absolute() {
            if let Ok(relative) = file.strip_prefix("/") {
                return InputSpec::File(Box::from(sysroot.join(relative)));
            }
        }
        spec
    }

    fn resolve(&self, input: &Input) -> Result<PathBuf> {
        match &input.spec {
            InputSpec::File(path) => {
                if path.exists() {
                    return Ok(path.to_path_buf());
                }
                if let Some(dir) = &input.search_first {
                    let candidate = dir.join(path);
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                }
                // Bare filenames may still come from the search path, which
                // is how scripts commonly reference libc_nonshared.a.
                if path.components().count() == 1 {
                    for dir in &self.search_path {
                        let candidate = dir.join(path);
                        if candidate.exists() {
                            return Ok(candidate);
                        }
                    }
                }
                bail!("Input file `{}` not found", path.display());
            }
            InputSpec::Lib(name) => {
                let mut dirs = Vec::new();
                if let Some(dir) = &input.search_first {
                    dirs.push(dir.clone());
                }
                dirs.extend(self.search_path.iter().cloned());
                for dir in &dirs {
                    if input.modifiers.allow_shared {
                        let candidate = dir.join(format!("lib{name}.so"));
                        if candidate.exists() {
                            return Ok(candidate);
                        }
                    }
                    let candidate = dir.join(format!("lib{name}.a"));
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                }
                Err(anyhow!("Library `-l{name}` not found in search path"))
            }
        }
    }
}
