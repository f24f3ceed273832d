//! A small `Reporter`-shaped trait (info/warn/error) so the library core
//! stays decoupled from `println!`, matching the CLI/engine split already
//! present in this codebase.

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

pub struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_reporter_methods_are_callable() {
        let mut rep = CliReporter;
        rep.info("info");
        rep.warn("warn");
        rep.error("error");
    }
}
