use crate::args::Args;
use crate::error::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod args;
pub(crate) mod archive;
pub(crate) mod chunks;
pub(crate) mod coff;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod file_writer;
pub(crate) mod fs;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod liveness;
pub(crate) mod parsing;
pub(crate) mod pe_writer;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod x86_64;

pub struct Linker {
    action: args::Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> Result<Self> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> Result {
        match &self.action {
            args::Action::Link(args) => {
                let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    EnvFilter::new(if args.verbose { "debug" } else { "warn" })
                });
                // Tests run several links in one process; only the first registration wins.
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer())
                    .with(filter)
                    .try_init();
                link(args)
            }
            args::Action::Version => {
                println!("peld version {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link(args: &Args) -> Result {
    let output = file_writer::Output::new(args);
    let input_data = input_data::InputData::from_args(args)?;
    let names_alloc = bumpalo::Bump::new();
    let mut symbol_db = symbol_db::SymbolDb::build(&input_data, &names_alloc, args)?;
    symbol_db.load_archive_members()?;
    symbol_db.finalize()?;
    let layout = layout::compute(&mut symbol_db)?;
    pe_writer::write(&output, &symbol_db, &layout)?;
    Ok(())
}
