//! Baseline id sequencing for predictive preloading.

use std::path::{Path, PathBuf};

/// Derives the baselines likely to be requested after `id`.
pub trait BaselineSequence: Send + Sync + 'static {
    /// Up to `distance` `(id, path)` pairs following `id`, nearest first.
    fn successors(&self, id: &str, path: &Path, distance: usize) -> Vec<(String, PathBuf)>;
}

/// Sequencing for ids of the form `name_<integer>`.
///
/// `checkout_7` is followed by `checkout_8`, `checkout_9`, ... Zero padding
/// is kept (`shot_009` → `shot_010`). The path of a successor is the
/// original path with the id replaced in its file name, or `<id>.<ext>` in
/// the same directory when the file name does not contain the id.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericSuffixSequence;

impl NumericSuffixSequence {
    fn split(id: &str) -> Option<(&str, &str, u64)> {
        let (stem, digits) = id.rsplit_once('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let number = digits.parse().ok()?;
        Some((stem, digits, number))
    }

    fn successor_path(id: &str, next: &str, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let renamed = if file_name.contains(id) {
            file_name.replacen(id, next, 1)
        } else {
            match path.extension() {
                Some(ext) => format!("{}.{}", next, ext.to_string_lossy()),
                None => next.to_string(),
            }
        };

        match path.parent() {
            Some(parent) => parent.join(renamed),
            None => PathBuf::from(renamed),
        }
    }
}

impl BaselineSequence for NumericSuffixSequence {
    fn successors(&self, id: &str, path: &Path, distance: usize) -> Vec<(String, PathBuf)> {
        let Some((stem, digits, number)) = Self::split(id) else {
            return Vec::new();
        };

        (1..=distance as u64)
            .filter_map(|step| number.checked_add(step))
            .map(|n| {
                let next = format!("{stem}_{n:0width$}", width = digits.len());
                let next_path = Self::successor_path(id, &next, path);
                (next, next_path)
            })
            .collect()
    }
}
