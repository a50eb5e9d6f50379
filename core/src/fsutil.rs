use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Depth-first iterator over the regular files below a directory.
///
/// Uses an explicit stack, so arbitrarily deep trees cannot overflow the
/// call stack. Symlinks are reported as files and never followed.
pub struct Walk {
    pending_dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

pub fn walk_files(root: &Path) -> Walk {
    Walk {
        pending_dirs: vec![root.to_path_buf()],
        files: Vec::new(),
    }
}

impl Iterator for Walk {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.files.pop() {
                return Some(Ok(file));
            }
            let dir = self.pending_dirs.pop()?;
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => return Some(Err(err)),
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => return Some(Err(err)),
                };
                match entry.file_type() {
                    Ok(kind) if kind.is_dir() => self.pending_dirs.push(entry.path()),
                    Ok(_) => self.files.push(entry.path()),
                    Err(err) => return Some(Err(err)),
                }
            }
        }
    }
}

/// Case-insensitive extension check; `ext` has no leading dot.
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Copies a file or a whole directory tree. Returns the number of bytes copied.
pub fn copy_recursive(src: &Path, dst: &Path) -> io::Result<u64> {
    if !fs::metadata(src)?.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return fs::copy(src, dst);
    }

    let mut copied = 0u64;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to)?;
        for entry in fs::read_dir(&from)? {
            let entry = entry?;
            let target = to.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                stack.push((entry.path(), target));
            } else {
                copied += fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(copied)
}

pub fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
