//! A handwritten parser for our arguments.
//!
//! We don't use a third-party library like clap because we need to accept options the way
//! `link.exe` spells them: a single leading `-` or `/`, a colon between an option and its value,
//! case-insensitive option names, and bare paths as positional inputs. That shape doesn't map
//! onto the usual GNU-style parsers.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use std::path::PathBuf;

pub(crate) const DEFAULT_IMAGE_BASE: u64 = 0x1_4000_0000;
pub(crate) const DEFAULT_ENTRY: &str = "main";

pub(crate) enum Action {
    Link(Args),
    Version,
}

#[derive(Debug)]
pub struct Args {
    pub(crate) inputs: Vec<PathBuf>,
    pub(crate) output: PathBuf,
    pub(crate) entry: String,
    pub(crate) image_base: u64,
    pub(crate) verbose: bool,
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    // Skip argv[0].
    input.next();

    let mut inputs = Vec::new();
    let mut output = None;
    let mut entry = None;
    let mut image_base = None;
    let mut verbose = false;

    for arg in input {
        let arg = arg.as_ref();
        if arg == "--version" {
            return Ok(Action::Version);
        }
        // A leading `/` only introduces an option when the name is one we know; otherwise it's an
        // absolute path on a Unix host.
        let option = match (arg.strip_prefix('-'), arg.strip_prefix('/')) {
            (Some(option), _) => Some(option),
            (None, Some(option)) if is_known_option(option) => Some(option),
            _ => None,
        };
        let Some(option) = option else {
            inputs.push(PathBuf::from(arg));
            continue;
        };
        let (name, value) = match option.split_once(':') {
            Some((name, value)) => (name.to_ascii_lowercase(), Some(value)),
            None => (option.to_ascii_lowercase(), None),
        };
        match name.as_str() {
            "out" => output = Some(PathBuf::from(required(&name, value)?)),
            "entry" => entry = Some(required(&name, value)?.to_owned()),
            "base" => {
                let value = required(&name, value)?;
                let parsed = if let Some(hex) = value.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                } else {
                    value.parse()
                };
                image_base =
                    Some(parsed.with_context(|| format!("Invalid image base `{value}`"))?);
            }
            "verbose" => verbose = true,
            _ => bail!("Unrecognised option `{arg}`"),
        }
    }

    if inputs.is_empty() {
        bail!("No input files");
    }

    // Like link.exe, default the output name to the first input with an .exe extension.
    let output = output.unwrap_or_else(|| inputs[0].with_extension("exe"));

    Ok(Action::Link(Args {
        inputs,
        output,
        entry: entry.unwrap_or_else(|| DEFAULT_ENTRY.to_owned()),
        image_base: image_base.unwrap_or(DEFAULT_IMAGE_BASE),
        verbose,
    }))
}

fn is_known_option(option: &str) -> bool {
    let name = option.split(':').next().unwrap_or(option);
    matches!(
        name.to_ascii_lowercase().as_str(),
        "out" | "entry" | "base" | "verbose"
    )
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.with_context(|| format!("Option `{name}` requires a value, e.g. -{name}:VALUE"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_link(args: &[&str]) -> Args {
        match parse(args.iter()).unwrap() {
            Action::Link(args) => args,
            Action::Version => panic!("expected link action"),
        }
    }

    #[test]
    fn basic() {
        let args = parse_link(&["peld", "-out:a.exe", "main.obj", "util.lib"]);
        assert_eq!(args.output, PathBuf::from("a.exe"));
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.entry, "main");
        assert_eq!(args.image_base, DEFAULT_IMAGE_BASE);
        assert!(!args.verbose);
    }

    #[test]
    fn link_exe_spellings() {
        let args = parse_link(&["peld", "/OUT:b.exe", "/Entry:start", "/verbose", "b.obj"]);
        assert_eq!(args.output, PathBuf::from("b.exe"));
        assert_eq!(args.entry, "start");
        assert!(args.verbose);
    }

    #[test]
    fn base_parses_hex_and_decimal() {
        assert_eq!(
            parse_link(&["peld", "-base:0x180000000", "m.obj"]).image_base,
            0x1_8000_0000
        );
        assert_eq!(parse_link(&["peld", "-base:4096", "m.obj"]).image_base, 4096);
    }

    #[test]
    fn default_output_name() {
        let args = parse_link(&["peld", "main.obj"]);
        assert_eq!(args.output, PathBuf::from("main.exe"));
    }

    #[test]
    fn absolute_paths_are_not_options() {
        let args = parse_link(&["peld", "/tmp/build/main.obj", "-out:/tmp/a.exe"]);
        assert_eq!(args.inputs, vec![PathBuf::from("/tmp/build/main.obj")]);
        assert_eq!(args.output, PathBuf::from("/tmp/a.exe"));
    }

    #[test]
    fn rejects_unknown_options() {
        assert!(parse(["peld", "-frobnicate", "m.obj"].iter()).is_err());
        assert!(parse(["peld"].iter()).is_err());
    }
}
