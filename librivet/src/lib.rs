use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub(crate) mod alignment;
pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod arm;
pub(crate) mod backend;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod fragment;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod linker_script;
pub(crate) mod merge_string;
pub(crate) mod module;
pub(crate) mod pipeline;
pub(crate) mod relocation;
pub(crate) mod relocator;
pub(crate) mod section;
pub(crate) mod stub;
pub(crate) mod symbol;
pub(crate) mod symbol_pool;
pub(crate) mod x86_64;

pub use error::LinkError;

pub struct Linker {
    action: args::Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> error::Result<Self> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> error::Result {
        match &self.action {
            args::Action::Link(args) => {
                // try_init so that a host program (or test harness) driving
                // several links in one process doesn't trip the global
                // subscriber.
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .with(EnvFilter::from_default_env())
                    .try_init();
                pipeline::link(args)
            }
            args::Action::Version => {
                println!("rivet {} (compatible with GNU linkers)", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}
