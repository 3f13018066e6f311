//! Stepping through acquisition series on disk.
//!
//! Detector software numbers consecutive images (`sample_00012.tif`) and
//! sometimes consecutive directories (`run_3/`). These helpers derive the
//! neighbour of a file or directory from that number, or from the
//! creation time when the numbering is not usable.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// How to find the neighbouring file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileIteration {
    /// Change the trailing integer of the file stem.
    #[default]
    Number,
    /// Step through the directory ordered by creation time.
    Time,
}

/// Splits `s` into `(head, digits)` where `digits` is the trailing run of
/// ASCII digits.
fn split_trailing_number(s: &str) -> Option<(&str, &str)> {
    let head = s.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &s[head.len()..];
    (!digits.is_empty()).then_some((head, digits))
}

/// Replaces the trailing number of `stem` by `number + step`, keeping the
/// zero padding width. Returns the padded and the unpadded candidates.
fn stepped_names(stem: &str, step: i64) -> Option<(String, String)> {
    let (head, digits) = split_trailing_number(stem)?;
    let value: i64 = digits.parse().ok()?;
    let next = value.checked_add(step).filter(|v| *v >= 0)?;
    let width = digits.len();
    Some((format!("{head}{next:0width$}"), format!("{head}{next}")))
}

fn with_stem(path: &Path, stem: &str) -> PathBuf {
    let mut name = stem.to_string();
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    path.with_file_name(name)
}

fn numbered_neighbour(path: &Path, step: i64) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_str()?;
    let (padded, plain) = stepped_names(stem, step)?;
    [padded, plain]
        .iter()
        .map(|s| with_stem(path, s))
        .find(|p| p.is_file())
}

fn created(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.created().or_else(|_| m.modified()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Files of `dir` with the given extension, sorted by creation time then
/// name.
fn by_creation_time(dir: &Path, extension: Option<&std::ffi::OsStr>) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension() == extension)
        .map(|p| (created(&p), p))
        .collect();
    files.sort();
    files.into_iter().map(|(_, p)| p).collect()
}

fn timed_neighbour(path: &Path, step: i64) -> Option<PathBuf> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let files = by_creation_time(dir, path.extension());
    let name = path.file_name()?;
    let pos = files.iter().position(|p| p.file_name() == Some(name))?;
    let target = i64::try_from(pos).ok()?.checked_add(step)?;
    files.get(usize::try_from(target).ok()?).cloned()
}

/// The file `step` positions away from `path` (negative steps go back).
/// Returns `None` when no such file exists.
#[must_use]
pub fn neighbour_file(path: &Path, step: i64, mode: FileIteration) -> Option<PathBuf> {
    match mode {
        FileIteration::Number => numbered_neighbour(path, step),
        FileIteration::Time => timed_neighbour(path, step),
    }
}

/// Shorthand for `neighbour_file(path, 1, mode)`.
#[must_use]
pub fn next_file(path: &Path, mode: FileIteration) -> Option<PathBuf> {
    neighbour_file(path, 1, mode)
}

/// Shorthand for `neighbour_file(path, -1, mode)`.
#[must_use]
pub fn previous_file(path: &Path, mode: FileIteration) -> Option<PathBuf> {
    neighbour_file(path, -1, mode)
}

/// Lists the files of the sibling directory whose trailing number differs
/// by `step` from the directory holding `path`, keeping only files with the
/// same extension as `path`. Missing siblings yield an empty list.
#[must_use]
pub fn sibling_folder_files(path: &Path, step: i64) -> Vec<PathBuf> {
    let Some(dir) = path.parent() else {
        return Vec::new();
    };
    let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let Some((padded, plain)) = stepped_names(name, step) else {
        return Vec::new();
    };
    let Some(root) = dir.parent() else {
        return Vec::new();
    };
    let Some(sibling) = [padded, plain]
        .iter()
        .map(|n| root.join(n))
        .find(|p| p.is_dir())
    else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(&sibling) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension() == path.extension())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_stepped_names_keep_padding() {
        assert_eq!(
            stepped_names("img_0009", 1),
            Some(("img_0010".to_string(), "img_10".to_string()))
        );
        assert_eq!(stepped_names("img_0000", -1), None);
        assert_eq!(stepped_names("img", 1), None);
    }

    #[test]
    fn test_numbered_iteration() {
        let dir = tempdir().unwrap();
        for name in ["s_008.tif", "s_009.tif", "s_010.tif"] {
            touch(&dir.path().join(name));
        }
        let start = dir.path().join("s_009.tif");
        assert_eq!(
            next_file(&start, FileIteration::Number),
            Some(dir.path().join("s_010.tif"))
        );
        assert_eq!(
            previous_file(&start, FileIteration::Number),
            Some(dir.path().join("s_008.tif"))
        );
        assert_eq!(next_file(&dir.path().join("s_010.tif"), FileIteration::Number), None);
    }

    #[test]
    fn test_time_iteration_filters_extension() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("b.tif");
        let b = dir.path().join("a.tif");
        touch(&a);
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&dir.path().join("noise.txt"));
        touch(&b);
        assert_eq!(next_file(&a, FileIteration::Time), Some(b.clone()));
        assert_eq!(previous_file(&b, FileIteration::Time), Some(a));
        assert_eq!(next_file(&b, FileIteration::Time), None);
    }

    #[test]
    fn test_sibling_folder_files() {
        let dir = tempdir().unwrap();
        let run1 = dir.path().join("run_1");
        let run2 = dir.path().join("run_2");
        fs::create_dir(&run1).unwrap();
        fs::create_dir(&run2).unwrap();
        touch(&run1.join("x.tif"));
        touch(&run2.join("y.tif"));
        touch(&run2.join("z.tif"));
        touch(&run2.join("log.txt"));

        let files = sibling_folder_files(&run1.join("x.tif"), 1);
        assert_eq!(files, vec![run2.join("y.tif"), run2.join("z.tif")]);
        assert!(sibling_folder_files(&run1.join("x.tif"), -1).is_empty());
        assert!(sibling_folder_files(&run2.join("y.tif"), 5).is_empty());
    }
}
