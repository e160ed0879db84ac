//! Console output helpers: colorized tags and progress bars.
//!
//! Tags are colored only when the stream is a terminal; progress bars are
//! drawn by indicatif, which already suppresses itself when stdout is
//! redirected.

use std::io::IsTerminal;

use indicatif::{ProgressBar as Bar, ProgressStyle};

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[94m";
const RESET: &str = "\x1b[0m";

fn tag(color: &str, msg: &str) -> String {
    if std::io::stdout().is_terminal() {
        format!("{}{}{}", color, msg, RESET)
    } else {
        msg.to_string()
    }
}

pub fn print_error(msg: &str) {
    if std::io::stderr().is_terminal() {
        eprintln!("{}{}{}", RED, msg, RESET);
    } else {
        eprintln!("{}", msg);
    }
}

pub fn print_warn(msg: &str) {
    println!("{}", tag(YELLOW, msg));
}

pub fn print_info(msg: &str) {
    println!("{}", tag(BLUE, msg));
}

pub fn print_success(msg: &str) {
    println!("{}", tag(GREEN, msg));
}

/// Progress reporting for long erase/program/read loops.
pub struct ProgressBar {
    bar: Bar,
}

impl ProgressBar {
    pub fn new(msg: &'static str, max_value: u64) -> Self {
        let bar = Bar::new(max_value);
        bar.set_style(
            ProgressStyle::with_template("{msg}: [{bar:50}] {percent:>3}%")
                .unwrap()
                .progress_chars("= "),
        );
        bar.set_message(msg);
        Self { bar }
    }

    pub fn display(&self, value: u64) {
        self.bar.set_position(value);
    }

    pub fn done(&self) {
        self.bar.finish_and_clear();
        print_success("Done");
    }

    pub fn fail(&self) {
        self.bar.finish_and_clear();
        print_error("Fail");
    }
}
