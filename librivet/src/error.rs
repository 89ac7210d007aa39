pub(crate) use anyhow::Context;
pub(crate) use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The classes of failure that the link pipeline distinguishes. Most are
/// fatal at first occurrence; `RelocOverflow` and `BadReloc` accumulate per
/// relocation and fail the link once the apply phase has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    UnrecognizedInput(String),
    MultipleDefinition(String),
    UndefinedReference(String),
    /// An undefined reference from a text section, attributed to the function
    /// containing the relocation site.
    UndefinedReferenceInText {
        symbol: String,
        file: String,
        caller: String,
    },
    MixedStaticShared(String),
    NMagicNotStatic,
    CannotMergeSection(String),
    BadMergeOffset(u64),
    RelocOverflow(String),
    BadReloc(String),
    UnsupportedReloc(String),
    UnknownReloc(String),
    FailAllocatePlt(String),
    UnrecognizedOutputSection(String),
    RelaxationDiverged,
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::UnrecognizedInput(path) => {
                write!(f, "unrecognized input file `{path}`")
            }
            LinkError::MultipleDefinition(name) => {
                write!(f, "multiple definition of `{name}`")
            }
            LinkError::UndefinedReference(name) => {
                write!(f, "undefined reference to `{name}`")
            }
            LinkError::UndefinedReferenceInText {
                symbol,
                file,
                caller,
            } => {
                write!(
                    f,
                    "{file}: in function `{caller}`: undefined reference to `{symbol}`"
                )
            }
            LinkError::MixedStaticShared(path) => {
                write!(f, "attempted static link of shared object `{path}`")
            }
            LinkError::NMagicNotStatic => {
                write!(f, "--nmagic is only supported for fully static links")
            }
            LinkError::CannotMergeSection(name) => {
                write!(f, "cannot merge section `{name}`")
            }
            LinkError::BadMergeOffset(offset) => {
                write!(
                    f,
                    "relocation refers to offset 0x{offset:x} before any string in a merge section"
                )
            }
            LinkError::RelocOverflow(what) => {
                write!(f, "relocation overflow: {what}")
            }
            LinkError::BadReloc(what) => write!(f, "bad relocation: {what}"),
            LinkError::UnsupportedReloc(what) => {
                write!(f, "unsupported relocation: {what}")
            }
            LinkError::UnknownReloc(what) => write!(f, "unknown relocation: {what}"),
            LinkError::FailAllocatePlt(name) => {
                write!(f, "failed to allocate a PLT entry for `{name}`")
            }
            LinkError::UnrecognizedOutputSection(name) => {
                write!(f, "no output section mapping matches input section `{name}`")
            }
            LinkError::RelaxationDiverged => {
                write!(f, "stub relaxation failed to reach a fixpoint")
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Like debug_assert, but bails instead of panicking. Returning an error lets
/// callers attach context such as which file or symbol was being processed.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}

/// Prints a warning. Using our own function makes warning sites easy to
/// find if a suppression flag is ever added.
pub(crate) fn warning(message: &str) {
    eprintln!("rivet: warning: {message}");
}

pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("rivet: error: {error:#}");
    std::process::exit(1);
}
