use std::fs::File;
use std::io::{self, BufRead};
use std::path::Path;

/// Non-empty, trimmed lines of a target list. Lines starting with `#` are
/// comments.
pub fn read_lines(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .filter_map(|line| {
            let line = line.ok()?;
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() || trimmed.starts_with('#') { None } else { Some(trimmed) }
        })
        .collect();
    Ok(lines)
}
