use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            Component::Normal(segment) => out.push(segment),
            Component::RootDir => out.push(component.as_os_str()),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
        }
    }

    out
}

/// Path of `target` as seen from the directory `base`. Both are expected to
/// be normalized; paths on different roots come back unchanged.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<_> = base.components().collect();
    let target_components: Vec<_> = target.components().collect();
    let shared = base
        .iter()
        .zip(&target_components)
        .take_while(|(left, right)| left == right)
        .count();
    if shared == 0 && base.first() != target_components.first() {
        return target.to_path_buf();
    }

    let mut out = PathBuf::new();
    for _ in shared..base.len() {
        out.push("..");
    }
    for component in &target_components[shared..] {
        out.push(component.as_os_str());
    }
    out
}

pub fn path_exists_including_dangling_symlink(path: &Path) -> std::io::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// Whether `link` is a symlink resolving (lexically) to `target`.
pub fn symlink_points_to(link: &Path, target: &Path) -> std::io::Result<bool> {
    let metadata = std::fs::symlink_metadata(link)?;
    if !metadata.file_type().is_symlink() {
        return Ok(false);
    }

    let recorded = std::fs::read_link(link)?;
    let resolved = if recorded.is_absolute() {
        normalize_path(&recorded)
    } else {
        let parent = link.parent().ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("symlink has no parent directory: {}", link.display()),
            )
        })?;
        normalize_path(&parent.join(recorded))
    };

    Ok(resolved == normalize_path(target))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{normalize_path, relative_path};

    #[test]
    fn normalize_drops_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/srv/app/./conf/../main.cairn")),
            PathBuf::from("/srv/app/main.cairn")
        );
    }

    #[test]
    fn relative_path_walks_up_and_down() {
        assert_eq!(
            relative_path(Path::new("/srv/app"), Path::new("/srv/app/db/main.cairn")),
            PathBuf::from("db/main.cairn")
        );
        assert_eq!(
            relative_path(Path::new("/srv/app/web"), Path::new("/srv/shared/base.cairn")),
            PathBuf::from("../../shared/base.cairn")
        );
    }
}
