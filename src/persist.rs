use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// A set of file writes applied all together or not at all.
#[derive(Default)]
pub struct Transaction {
    writes: Vec<(PathBuf, Vec<u8>)>,
}

struct Staged {
    target: PathBuf,
    temporary: PathBuf,
    previous: Option<Vec<u8>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        self.writes.push((path.into(), content.into()));
        self
    }

    /// Stages every file next to its target, then renames them into place. Any
    /// failure removes the staged files and restores what the targets held before.
    pub fn commit(self) -> io::Result<()> {
        let mut staged = Vec::with_capacity(self.writes.len());
        for (target, content) in self.writes {
            match stage(&target, &content) {
                Ok(entry) => staged.push(entry),
                Err(error) => {
                    discard(&staged);
                    return Err(error);
                }
            }
        }

        for (index, entry) in staged.iter().enumerate() {
            if let Err(error) = fs::rename(&entry.temporary, &entry.target) {
                log::warn!(
                    "[config] cannot replace {}: {error}, rolling back",
                    entry.target.display()
                );
                rollback(&staged[..index]);
                discard(&staged[index..]);
                return Err(error);
            }
        }
        Ok(())
    }
}

fn stage(target: &Path, content: &[u8]) -> io::Result<Staged> {
    let previous = match fs::read(target) {
        Ok(previous) => Some(previous),
        Err(error) if error.kind() == io::ErrorKind::NotFound => None,
        Err(error) => return Err(error),
    };

    let mut name = target
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?
        .to_os_string();
    name.push(".tmp");
    let temporary = target.with_file_name(name);
    fs::write(&temporary, content)?;

    Ok(Staged {
        target: target.to_path_buf(),
        temporary,
        previous,
    })
}

fn discard(staged: &[Staged]) {
    for entry in staged {
        let _ = fs::remove_file(&entry.temporary);
    }
}

fn rollback(committed: &[Staged]) {
    for entry in committed {
        let result = match &entry.previous {
            Some(previous) => fs::write(&entry.target, previous),
            None => fs::remove_file(&entry.target),
        };
        if let Err(error) = result {
            log::warn!("[config] rollback of {} failed: {error}", entry.target.display());
        }
    }
}
