use super::*;
use volume::Volume;

/// Walks `path` from root (absolute) or from `cwd` (relative).
/// Returns the inode reached and the one it was reached from.
pub fn resolve(vol: &Volume, cwd: InodeId, path: &str) -> Result<(InodeId, InodeId)> {
    let start = if path.is_empty() || path.starts_with(SEPARATOR) {
        ROOT_ID
    } else {
        cwd
    };

    let (mut current, mut parent) = (start, start);
    for segment in path.split(SEPARATOR).filter(|segment| !segment.is_empty()) {
        let inode = vol.read_inode(current)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        let next = dir::find_by_name(vol, &inode, segment)?
            .ok_or_else(|| FsError::NotFound(path.to_owned()))?;
        parent = current;
        current = next;
    }
    Ok((current, parent))
}

/// Splits off the last segment: `/a/b` -> (`/a`, `b`), `b` -> (`.`, `b`), `/b` -> (`/`, `b`).
pub fn split(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches(SEPARATOR);
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument(format!("`{path}` names no entry")));
    }
    Ok(match trimmed.rfind(SEPARATOR) {
        None => (".", trimmed),
        Some(0) => ("/", &trimmed[1..]),
        Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
    })
}

/// Absolute path of directory `id`, rebuilt through the `..` entries.
pub fn path_to_root(vol: &Volume, id: InodeId) -> Result<String> {
    path_to_root_within(vol, id, PATH_CAPACITY)
}

/// Like `path_to_root`, but never longer than `capacity` bytes: leading
/// components that do not fit are replaced by `PATH_TRUNCATED`.
pub fn path_to_root_within(vol: &Volume, id: InodeId, capacity: usize) -> Result<String> {
    if id == ROOT_ID {
        return Ok(SEPARATOR.to_string());
    }

    let mut path = String::new();
    let mut current = id;
    // a sane tree is never deeper than it has inodes
    for _ in 0..vol.block_count() {
        if current == ROOT_ID {
            return Ok(path);
        }
        let inode = vol.read_inode(current)?;
        let parent_id = dir::parent_of(vol, &inode)?;
        let parent = vol.read_inode(parent_id)?;
        let name = dir::find_by_id(vol, &parent, current)?.ok_or_else(|| {
            FsError::inconsistent(format!("dir {parent_id} does not list {current}"))
        })?;

        // above the top component there is always either a name or the marker
        let reserve = if parent_id == ROOT_ID { 0 } else { PATH_TRUNCATED.len() };
        if path.len() + name.len() + 1 + reserve > capacity {
            path.insert_str(0, PATH_TRUNCATED);
            return Ok(path);
        }
        path.insert_str(0, &name);
        path.insert(0, SEPARATOR);
        current = parent_id;
    }
    Err(FsError::inconsistent(format!("`..` chain of {id} loops")))
}
