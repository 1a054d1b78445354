use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Appends `.<idx>` to `path`, naming the per-rank copy of a shared file.
///
/// # Arguments
/// * `path` - The shared path, a log file or a checkpoint.
/// * `idx` - The rank or job index.
///
/// # Returns
/// The suffixed path, `model.json` becomes `model.json.3`.
pub fn with_suffix(path: impl AsRef<Path>, idx: usize) -> PathBuf {
    let mut name = OsString::from(path.as_ref().as_os_str());
    name.push(format!(".{idx}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_appended() {
        assert_eq!(
            with_suffix("logs/sync.log", 2),
            PathBuf::from("logs/sync.log.2")
        );
        assert_eq!(with_suffix("model", 0), PathBuf::from("model.0"));
    }
}
