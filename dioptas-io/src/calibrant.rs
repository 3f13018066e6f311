//! Calibrant d-spacing files (`.D`).

use crate::{Error, Result};
use dioptas_core::calibrant::Calibrant;
use std::path::Path;

/// Parses d-spacing text: the first number of every line, `#` comments
/// and non-numeric lines ignored.
#[must_use]
pub fn parse_calibrant(name: &str, text: &str) -> Calibrant {
    let d_spacings = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .filter_map(|line| line.split_whitespace().next()?.parse::<f64>().ok())
        .collect();
    Calibrant::new(name, d_spacings)
}

/// Reads a calibrant file; the calibrant is named after the file stem.
///
/// # Errors
/// `FileIo` if unreadable, `InvalidFormat` if it lists no d-spacing.
pub fn read_calibrant<P: AsRef<Path>>(path: P) -> Result<Calibrant> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let calibrant = parse_calibrant(&name, &text);
    if calibrant.d_spacings.is_empty() {
        return Err(Error::InvalidFormat(format!(
            "{} lists no d-spacing",
            path.display()
        )));
    }
    Ok(calibrant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_sorts() {
        let text = "# LaB6 SRM 660a\n2.9393 # (1,1,0)\n4.15690\t# (1,0,0)\n\nfoo bar\n2.4000\n";
        let calibrant = parse_calibrant("LaB6", text);
        assert_eq!(calibrant.name, "LaB6");
        assert_eq!(calibrant.d_spacings, vec![4.1569, 2.9393, 2.4]);
    }

    #[test]
    fn test_empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.D");
        std::fs::write(&path, "# nothing\n").unwrap();
        assert!(matches!(read_calibrant(&path), Err(Error::InvalidFormat(_))));
    }
}
