//! Command-line argument parsing. We accept the subset of GNU ld's interface
//! that the pipeline implements. Parsing is hand-rolled because ld-style
//! arguments (single-dash long names, `-l` fusing, `--opt value` and
//! `--opt=value` both valid) don't fit derive-style parsers.

use crate::arch::Architecture;
use crate::error::Result;
use anyhow::anyhow;
use anyhow::bail;
use std::path::Path;
use std::path::PathBuf;

pub struct Args {
    pub output: PathBuf,
    pub inputs: Vec<Input>,
    pub lib_search_path: Vec<Box<Path>>,
    pub output_kind: OutputKind,
    pub is_static: bool,
    pub nmagic: bool,
    pub entry: Option<String>,
    pub soname: Option<String>,
    pub sysroot: Option<Box<Path>>,
    pub arch: Option<Architecture>,
    /// `--defsym SYM=EXPR` assignments, evaluated with the linker-script
    /// expression evaluator.
    pub defsym: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Input {
    pub spec: InputSpec,
    /// A directory to search before the configured search path. Used for
    /// inputs requested by a linker script, which search the script's own
    /// directory first.
    pub search_first: Option<PathBuf>,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    File(Box<Path>),
    Lib(Box<str>),
}

/// Argument-position-dependent state that applies to the inputs that follow.
#[derive(Debug, Clone, Copy)]
pub struct Modifiers {
    /// Whether shared objects may satisfy `-l` requests (`-Bdynamic`).
    pub allow_shared: bool,

    /// Whether a shared object should only become a DT_NEEDED entry if it
    /// satisfies some undefined symbol.
    pub as_needed: bool,
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            allow_shared: true,
            as_needed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    SharedObject,
    Relocatable,
    FlatBinary,
}

impl OutputKind {
    pub(crate) fn is_relocatable(self) -> bool {
        self == OutputKind::Relocatable
    }
}

pub enum Action {
    Link(Args),
    Version,
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut args = Args {
        output: PathBuf::from("a.out"),
        inputs: Vec::new(),
        lib_search_path: Vec::new(),
        output_kind: OutputKind::Executable,
        is_static: false,
        nmagic: false,
        entry: None,
        soname: None,
        sysroot: None,
        arch: None,
        defsym: Vec::new(),
    };
    let mut modifiers = Modifiers::default();
    let mut oformat_binary = false;

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        // `--opt=value` and `--opt value` are both accepted for long options.
        let split_prefix = |prefix: &str| -> Option<String> {
            arg.strip_prefix(prefix).map(str::to_owned)
        };

        let mut take_value = |name: &str| -> Result<String> {
            input
                .next()
                .map(|v| v.as_ref().to_owned())
                .ok_or_else(|| anyhow!("Missing argument to {name}"))
        };

        if let Some(rest) = arg.strip_prefix("-L") {
            let dir = if rest.is_empty() {
                take_value("-L")?
            } else {
                rest.to_owned()
            };
            args.lib_search_path.push(Box::from(Path::new(&dir)));
        } else if let Some(rest) = arg.strip_prefix("-l") {
            let lib = if rest.is_empty() {
                take_value("-l")?
            } else {
                rest.to_owned()
            };
            args.inputs.push(Input {
                spec: InputSpec::Lib(lib.into_boxed_str()),
                search_first: None,
                modifiers,
            });
        } else if arg == "-o" || arg == "--output" {
            args.output = PathBuf::from(take_value(arg)?);
        } else if let Some(value) = split_prefix("--output=") {
            args.output = PathBuf::from(value);
        } else if arg == "-e" || arg == "--entry" {
            args.entry = Some(take_value(arg)?);
        } else if let Some(value) = split_prefix("--entry=") {
            args.entry = Some(value);
        } else if arg == "-r" || arg == "--relocatable" || arg == "-i" {
            args.output_kind = OutputKind::Relocatable;
        } else if arg == "-shared" || arg == "--shared" || arg == "-Bshareable" {
            args.output_kind = OutputKind::SharedObject;
        } else if arg == "-static" || arg == "--static" || arg == "-Bstatic" || arg == "-dn" {
            args.is_static = true;
            modifiers.allow_shared = false;
        } else if arg == "-Bdynamic" || arg == "-dy" {
            modifiers.allow_shared = true;
        } else if arg == "--as-needed" {
            modifiers.as_needed = true;
        } else if arg == "--no-as-needed" {
            modifiers.as_needed = false;
        } else if arg == "-n" || arg == "--nmagic" {
            args.nmagic = true;
        } else if arg == "-soname" || arg == "--soname" || arg == "-h" {
            args.soname = Some(take_value(arg)?);
        } else if let Some(value) = split_prefix("--soname=") {
            args.soname = Some(value);
        } else if let Some(value) = split_prefix("--sysroot=") {
            args.sysroot = Some(Box::from(Path::new(&value)));
        } else if arg == "--oformat" {
            oformat_binary = parse_oformat(&take_value(arg)?)?;
        } else if let Some(value) = split_prefix("--oformat=") {
            oformat_binary = parse_oformat(&value)?;
        } else if arg == "--defsym" {
            args.defsym.push(parse_defsym(&take_value(arg)?)?);
        } else if let Some(value) = split_prefix("--defsym=") {
            args.defsym.push(parse_defsym(&value)?);
        } else if arg == "-T" || arg == "--script" {
            let path = take_value(arg)?;
            args.inputs.push(Input {
                spec: InputSpec::File(Box::from(Path::new(&path))),
                search_first: None,
                modifiers,
            });
        } else if let Some(value) = split_prefix("--script=") {
            args.inputs.push(Input {
                spec: InputSpec::File(Box::from(Path::new(&value))),
                search_first: None,
                modifiers,
            });
        } else if arg == "-m" {
            args.arch = Some(parse_emulation(&take_value(arg)?)?);
        } else if let Some(value) = split_prefix("-m") {
            args.arch = Some(parse_emulation(&value)?);
        } else if arg == "-z" {
            // -z keywords tune dynamic-loader behaviour that we don't model.
            let _ = take_value(arg)?;
        } else if arg == "--start-group" || arg == "-(" || arg == "--end-group" || arg == "-)" {
            // Archive members are pulled on demand to a fixpoint across all
            // archives, which subsumes group semantics.
        } else if arg == "--version" || arg == "-v" || arg == "-V" {
            return Ok(Action::Version);
        } else if arg == "--eh-frame-hdr" || arg == "--no-eh-frame-hdr" || arg == "--gc-sections"
            || arg == "--no-gc-sections" || arg == "--build-id" || arg.starts_with("--hash-style")
        {
            // Accepted for drop-in compatibility.
        } else if arg.starts_with('-') {
            bail!("Unrecognized argument `{arg}`");
        } else {
            args.inputs.push(Input {
                spec: InputSpec::File(Box::from(Path::new(arg))),
                search_first: None,
                modifiers,
            });
        }
    }

    if oformat_binary {
        if args.output_kind != OutputKind::Executable {
            bail!("--oformat binary is only supported for executable output");
        }
        args.output_kind = OutputKind::FlatBinary;
    }

    Ok(Action::Link(args))
}

fn parse_oformat(value: &str) -> Result<bool> {
    match value {
        "binary" => Ok(true),
        other if other.starts_with("elf") => Ok(false),
        other => bail!("Unsupported --oformat `{other}`"),
    }
}

fn parse_defsym(value: &str) -> Result<(String, String)> {
    let (name, expr) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("--defsym requires SYMBOL=EXPRESSION, got `{value}`"))?;
    if name.is_empty() {
        bail!("--defsym requires a symbol name");
    }
    Ok((name.to_owned(), expr.to_owned()))
}

fn parse_emulation(value: &str) -> Result<Architecture> {
    match value {
        "elf_x86_64" => Ok(Architecture::X86_64),
        "armelf" | "armelf_linux_eabi" => Ok(Architecture::Arm),
        other => bail!("Unsupported emulation `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> Args {
        match parse(args.iter()).unwrap() {
            Action::Link(args) => args,
            Action::Version => panic!("expected link action"),
        }
    }

    #[test]
    fn test_basic() {
        let args = parse_args(&[
            "-o", "out", "crt0.o", "-L/usr/lib", "-lc", "main.o", "--entry=begin",
        ]);
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.inputs.len(), 3);
        assert_eq!(args.entry.as_deref(), Some("begin"));
        assert_eq!(
            args.inputs[1].spec,
            InputSpec::Lib(Box::from("c"))
        );
    }

    #[test]
    fn test_static_modifier_applies_to_following_inputs() {
        let args = parse_args(&["a.o", "-Bstatic", "-lfoo"]);
        assert!(args.inputs[0].modifiers.allow_shared);
        assert!(!args.inputs[1].modifiers.allow_shared);
    }

    #[test]
    fn test_relocatable_and_shared() {
        assert_eq!(parse_args(&["-r", "a.o"]).output_kind, OutputKind::Relocatable);
        assert_eq!(
            parse_args(&["-shared", "a.o"]).output_kind,
            OutputKind::SharedObject
        );
    }

    #[test]
    fn test_defsym() {
        let args = parse_args(&["--defsym=base=0x1000", "a.o"]);
        assert_eq!(args.defsym, vec![("base".to_owned(), "0x1000".to_owned())]);
    }

    #[test]
    fn test_oformat_binary() {
        assert_eq!(
            parse_args(&["--oformat", "binary", "a.o"]).output_kind,
            OutputKind::FlatBinary
        );
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(parse(["--definitely-not-a-flag"].iter()).is_err());
    }
}
