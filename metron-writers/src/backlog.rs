//! The per-writer on-disk backlog.
//!
//! Every rejected batch becomes one file of JSON Lines records under
//! `<data>/backlog/<writer_id>/items_<random>.data`. Replay order is
//! file mtime with the file name as tie-break, so batches survive agent
//! restarts in the order they were spilled. Files are removed only after
//! the batch has been delivered.
//!
//! In test mode nothing touches the disk, but the in-memory accounting
//! still tracks the would-be state so scenarios can observe backlog
//! growth and shrinkage.

use std::{
    fs, io,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rand::Rng;
use regex::Regex;
use tracing::{debug, error, info};

use crate::Envelope;

fn random_file_name() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..10)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("items_{suffix}.data")
}

pub struct Backlog {
    writer_id: String,
    directory: PathBuf,
    files: Mutex<Vec<String>>,
    test: bool,
}

impl Backlog {
    /// Opens (and creates) the backlog directory and scans it for files
    /// left behind by earlier runs.
    pub fn open(data_dir: &Path, writer_id: &str, test: bool) -> io::Result<Self> {
        let directory = data_dir.join("backlog").join(writer_id);
        fs::create_dir_all(&directory)?;

        let pattern = Regex::new("^items_[a-zA-Z0-9]+\\.data$").expect("valid pattern");
        let mut found: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && pattern.is_match(&file_name) {
                let modified = entry.metadata()?.modified()?;
                found.push((file_name, modified));
            }
        }
        found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        Ok(Self {
            writer_id: writer_id.to_string(),
            directory,
            files: Mutex::new(found.into_iter().map(|(name, _)| name).collect()),
            test,
        })
    }

    pub fn size(&self) -> usize {
        self.files.lock().expect("backlog lock poisoned").len()
    }

    /// Persists one batch as a new backlog file. The write is atomic:
    /// the data lands in a temporary file that is renamed into place.
    pub fn put(&self, items: &[Envelope]) {
        if items.is_empty() {
            return;
        }
        let file_name = random_file_name();
        if self.test {
            info!(
                name = %self.writer_id,
                "running in test mode, the backlog file will not be created"
            );
        } else if let Err(e) = self.write_file(&file_name, items) {
            error!(
                name = %self.writer_id,
                "cannot write the backlog file {file_name}: {e}"
            );
            return;
        }
        let mut files = self.files.lock().expect("backlog lock poisoned");
        files.push(file_name);
        debug!(
            name = %self.writer_id,
            "writing data to the writer's backlog, the backlog size is {}",
            files.len()
        );
    }

    fn write_file(&self, file_name: &str, items: &[Envelope]) -> io::Result<()> {
        let staging = self.directory.join(format!("{file_name}.tmp"));
        {
            let mut file = fs::File::create(&staging)?;
            for item in items {
                let line = serde_json::to_string(item)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.flush()?;
        }
        fs::rename(&staging, self.directory.join(file_name))
    }

    /// Loads the `count` oldest files and their flattened items. A file
    /// that cannot be parsed is set aside with a `.corrupt` suffix and
    /// dropped from the accounting so replay never wedges on it.
    pub fn peek(&self, count: usize) -> (Vec<String>, Vec<Envelope>) {
        let names: Vec<String> = {
            let files = self.files.lock().expect("backlog lock poisoned");
            files.iter().take(count).cloned().collect()
        };

        let mut readable = Vec::with_capacity(names.len());
        let mut items = Vec::new();
        for name in names {
            if self.test {
                readable.push(name);
                continue;
            }
            match self.read_file(&name) {
                Ok(batch) => {
                    items.extend(batch);
                    readable.push(name);
                }
                Err(e) => {
                    error!(
                        name = %self.writer_id,
                        "cannot read the backlog file {name}: {e}; setting it aside"
                    );
                    let path = self.directory.join(&name);
                    let _ = fs::rename(&path, path.with_extension("data.corrupt"));
                    self.forget(&[name]);
                }
            }
        }
        (readable, items)
    }

    fn read_file(&self, file_name: &str) -> io::Result<Vec<Envelope>> {
        let text = fs::read_to_string(self.directory.join(file_name))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            })
            .collect()
    }

    /// Unlinks delivered files and drops them from the accounting.
    pub fn remove(&self, file_names: &[String]) {
        if self.test {
            info!(
                name = %self.writer_id,
                "running in test mode, removing of backlog files is disabled"
            );
        } else {
            for name in file_names {
                if let Err(e) = fs::remove_file(self.directory.join(name)) {
                    error!(
                        name = %self.writer_id,
                        "cannot remove the backlog file {name}: {e}"
                    );
                }
            }
        }
        self.forget(file_names);
        debug!(
            name = %self.writer_id,
            "removing data from the writer's backlog, the backlog size is {}",
            self.size()
        );
    }

    fn forget(&self, file_names: &[String]) {
        let mut files = self.files.lock().expect("backlog lock poisoned");
        files.retain(|name| !file_names.contains(name));
    }
}
