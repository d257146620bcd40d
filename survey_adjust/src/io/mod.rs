//! File input and output helpers for project data and adjustment results.

pub mod project;
pub mod report;

use std::fs::File;
use std::io::{self, Read, Write};

pub use project::{read_project_json, write_project_json, Project};
pub use report::{AdjustmentReport, JsonResultWriter, ResultWriter};

/// Reads a file to string.
pub fn read_to_string(path: &str) -> io::Result<String> {
    let mut buffer = String::new();
    File::open(path)?.read_to_string(&mut buffer)?;
    Ok(buffer)
}

/// Writes a string to a file, replacing its contents.
pub fn write_string(path: &str, contents: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents.as_bytes())
}
