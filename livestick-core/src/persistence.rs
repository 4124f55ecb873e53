//! Content handling on the data (persistence) partition.
use crate::config::{LayoutDetection, PersistenceConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
#[cfg(unix)]
use walkdir::WalkDir;

/// Configuration file read by the live system's boot scripts.
pub const PERSISTENCE_CONF: &str = "persistence.conf";
const PERSISTENCE_CONF_CONTENT: &str = "/ union\n";
const LOST_AND_FOUND: &str = "lost+found";
const HOME: &str = "home";

/// Directory holding the persistent system tree on a mounted data partition.
pub fn resolve_root(mount: &Path, config: &PersistenceConfig) -> PathBuf {
    let subroot = mount.join(&config.subroot);
    match config.layout {
        LayoutDetection::Flat => mount.to_path_buf(),
        LayoutDetection::Subroot => subroot,
        LayoutDetection::Auto => {
            if !mount.join(HOME).is_dir() && subroot.is_dir() {
                debug!(root = %subroot.display(), "using sub-root layout");
                subroot
            } else {
                mount.to_path_buf()
            }
        }
    }
}

/// Writes the union configuration to a freshly formatted data partition.
pub fn write_persistence_conf(mount: &Path) -> Result<()> {
    fs::write(mount.join(PERSISTENCE_CONF), PERSISTENCE_CONF_CONTENT)?;
    Ok(())
}

/// Which parts of the data partition a reset clears.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOptions {
    /// Remove everything except the home directory.
    pub reset_system: bool,
    /// Rebuild the home directory from the skeleton.
    pub reset_home: bool,
}

/// Selectively clears a mounted data partition.
///
/// `lost+found` and the persistence configuration are always kept.
pub fn clear(mount: &Path, config: &PersistenceConfig, options: ClearOptions) -> Result<()> {
    let root = resolve_root(mount, config);
    info!(root = %root.display(), ?options, "clearing data partition");

    if options.reset_system {
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == LOST_AND_FOUND || name == PERSISTENCE_CONF || name == HOME {
                continue;
            }
            remove_entry(&entry.path())?;
        }
    }

    if options.reset_home {
        let home = root.join(HOME);
        if home.symlink_metadata().is_ok() {
            remove_entry(&home)?;
        }
        rebuild_home(&home, config)?;
    }
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    if path.symlink_metadata()?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn rebuild_home(home: &Path, config: &PersistenceConfig) -> Result<()> {
    let user_home = home.join(&config.user);
    fs::create_dir_all(&user_home)?;
    if config.skeleton.is_dir() {
        crate::storage::copy_tree(&config.skeleton, &user_home, &mut |_| {})?;
    } else {
        debug!(skeleton = %config.skeleton.display(), "no skeleton directory");
    }

    if let Some((uid, gid)) = config.home_owner {
        chown_tree(&user_home, uid, gid)?;
    }
    Ok(())
}

#[cfg(unix)]
fn chown_tree(root: &Path, uid: u32, gid: u32) -> Result<()> {
    use nix::fcntl::{AT_FDCWD, AtFlags};
    use nix::unistd::{Gid, Uid, fchownat};
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        // Skeleton links may point anywhere; change the link itself.
        fchownat(
            AT_FDCWD,
            entry.path(),
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )
        .map_err(io::Error::from)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn chown_tree(_root: &Path, _uid: u32, _gid: u32) -> Result<()> {
    Ok(())
}

/// A file written onto the data partition during an upgrade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverwriteEntry {
    /// Path inside the persistent system tree. A leading `/` is allowed.
    pub path: PathBuf,
    pub contents: String,
}

impl OverwriteEntry {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// The path relative to the system tree root, rejecting anything that
    /// would leave it.
    fn relative_path(&self) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in self.path.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::PreconditionFailed(format!(
                        "overwrite path {} leaves the system tree",
                        self.path.display()
                    )));
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(Error::PreconditionFailed("empty overwrite path".into()));
        }
        Ok(relative)
    }
}

/// Ordered list of files to overwrite. For a path listed more than once,
/// the earliest entry wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OverwriteList {
    entries: Vec<OverwriteEntry>,
}

impl OverwriteList {
    pub fn new(entries: Vec<OverwriteEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: OverwriteEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, index: usize) -> Option<OverwriteEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn entries(&self) -> &[OverwriteEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Swaps entry `index` with its predecessor. Returns false at the top.
    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.entries.len() {
            return false;
        }
        self.entries.swap(index - 1, index);
        true
    }

    /// Swaps entry `index` with its successor. Returns false at the bottom.
    pub fn move_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.entries.len() {
            return false;
        }
        self.entries.swap(index, index + 1);
        true
    }

    /// Validates every entry without touching the filesystem.
    pub fn check(&self) -> Result<()> {
        self.entries.iter().try_for_each(|e| e.relative_path().map(drop))
    }

    /// Writes the entries below `root` and returns how many files were written.
    pub fn apply(&self, root: &Path) -> Result<usize> {
        let mut written = HashSet::new();
        for entry in &self.entries {
            let relative = entry.relative_path()?;
            if !written.insert(relative.clone()) {
                debug!(path = %relative.display(), "already written by an earlier entry");
                continue;
            }
            let target = prepare_target(root, &relative)?;
            fs::write(&target, &entry.contents)?;
        }
        Ok(written.len())
    }
}

/// Creates the directories leading to `relative` below `root` without
/// following any symbolic link on the way. A link in place of the file itself
/// is removed so the write lands on the data partition.
fn prepare_target(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        current.push(component);
        let last = components.peek().is_none();
        let metadata = match current.symlink_metadata() {
            Ok(metadata) => Some(metadata),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        match metadata {
            Some(m) if m.file_type().is_symlink() && last => {
                debug!(path = %current.display(), "replacing symbolic link");
                fs::remove_file(&current)?;
            }
            Some(m) if m.file_type().is_symlink() => {
                return Err(Error::PreconditionFailed(format!(
                    "overwrite path {} goes through the symbolic link {}",
                    relative.display(),
                    current.display()
                )));
            }
            None if !last => fs::create_dir(&current)?,
            _ => {}
        }
    }
    Ok(current)
}
