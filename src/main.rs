fn main() {
    let result = peld::Linker::from_args(std::env::args()).and_then(|linker| linker.run());
    if let Some(error) = result.err() {
        eprintln!("peld: error: {error:#}");
        std::process::exit(1);
    }
}
