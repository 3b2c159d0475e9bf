use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Discover on-disk segment files belonging to `term` under `base`,
/// returning `(start_index, path)` pairs sorted by `start_index`.
///
/// Segment files are named `<base>.<term>.<startIndex>`; `base`'s file name
/// is used as the prefix to scan for siblings in its parent directory.
pub fn discover_segments(base: &Path, term: u64) -> io::Result<Vec<(u64, PathBuf)>> {
    let dir = base.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let prefix = base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let needle = format!("{prefix}.{term}.");

    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix(needle.as_str()) {
            if let Ok(start_index) = suffix.parse::<u64>() {
                found.push((start_index, entry.path()));
            }
        }
    }
    found.sort_by_key(|(start, _)| *start);
    Ok(found)
}

/// The on-disk path for the segment starting at `start_index` within `term`.
pub fn segment_path(base: &Path, term: u64, start_index: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{term}.{start_index}"));
    PathBuf::from(name)
}
