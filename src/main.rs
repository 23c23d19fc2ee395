//! studyweave CLI binary
//!
//! All logic lives in the library; `cli::run()` prints its own output and
//! errors, main only maps the result to a process exit.

fn main() {
    if let Err(code) = studyweave::cli::run() {
        std::process::exit(code.as_i32());
    }
}
