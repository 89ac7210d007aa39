fn main() {
    if let Err(error) = run() {
        librivet::error::report_error_and_exit(&error);
    }
}

fn run() -> librivet::error::Result {
    let linker = librivet::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}
