use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

/// Files on the mounted record volume.
#[derive(Debug, Clone)]
pub struct RecordVolume {
    root: PathBuf,
}

impl RecordVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// Opens `file` for appending, creating it if needed, without touching
    /// its contents.
    pub fn probe(&self, file: &str) -> Result<()> {
        self.open_append(file)?;
        Ok(())
    }

    pub fn append(&self, file: &str, line: &str) -> Result<()> {
        let mut f = self.open_append(file)?;
        f.write_all(line.as_bytes())
            .with_context(|| format!("append to {file}"))?;
        f.flush()?;
        Ok(())
    }

    /// Replaces the whole file.
    pub fn rewrite(&self, file: &str, contents: &str) -> Result<()> {
        let mut f = File::create(self.path(file)).with_context(|| format!("create {file}"))?;
        f.write_all(contents.as_bytes())
            .with_context(|| format!("write {file}"))?;
        f.flush()?;
        Ok(())
    }

    pub fn read(&self, file: &str) -> Result<Vec<u8>> {
        fs::read(self.path(file)).with_context(|| format!("read {file}"))
    }

    pub fn read_to_string(&self, file: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read(file)?).into_owned())
    }

    fn open_append(&self, file: &str) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(file))
            .with_context(|| format!("open {file}"))
    }
}

/// Driver side of a mount, released exactly once.
pub trait Unmount: Send {
    fn unmount(&mut self);
}

/// A mounted volume. Dropping it releases the mount.
pub struct Storage {
    volume: RecordVolume,
    mount: Option<Box<dyn Unmount>>,
}

impl Storage {
    /// Wraps an existing mount and checks that `file` can be opened.
    pub fn new(volume: RecordVolume, mount: Box<dyn Unmount>, file: &str) -> Result<Self> {
        let storage = Self {
            volume,
            mount: Some(mount),
        };
        storage.volume.probe(file)?;
        Ok(storage)
    }

    pub fn volume(&self) -> &RecordVolume {
        &self.volume
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(mut mount) = self.mount.take() {
            mount.unmount();
            info!("storage released");
        }
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}
