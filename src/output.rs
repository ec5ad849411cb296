use std::fs;
use std::io::{self, Write};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::GateError;
use crate::verdict::{Publisher, Verdict};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Writes one compact JSON verdict per line.
pub struct JsonLinesPublisher<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl JsonLinesPublisher<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> Publisher for JsonLinesPublisher<W> {
    fn publish(&self, verdict: &Verdict) -> Result<(), GateError> {
        let mut line =
            serde_json::to_vec(verdict).map_err(|err| GateError::Encode(err.to_string()))?;
        line.push(b'\n');
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| GateError::Publish("publisher lock poisoned".to_string()))?;
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|err| GateError::Publish(err.to_string()))
    }
}

/// Persists each verdict as `<dir>/<submission_id>.json`. A retried publish
/// rewrites the same file.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    dir: Utf8PathBuf,
}

impl DirectoryPublisher {
    pub fn new(dir: Utf8PathBuf) -> Result<Self, GateError> {
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| GateError::Filesystem(err.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn verdict_path(&self, submission_id: &str) -> Utf8PathBuf {
        self.dir.join(format!("{submission_id}.json"))
    }
}

impl Publisher for DirectoryPublisher {
    fn publish(&self, verdict: &Verdict) -> Result<(), GateError> {
        let content = serde_json::to_vec_pretty(verdict)
            .map_err(|err| GateError::Encode(err.to_string()))?;
        let mut tmp = NamedTempFile::new_in(self.dir.as_std_path())
            .map_err(|err| GateError::Publish(err.to_string()))?;
        tmp.write_all(&content)
            .map_err(|err| GateError::Publish(err.to_string()))?;
        let path = self.verdict_path(&verdict.submission_id);
        tmp.persist(path.as_std_path())
            .map_err(|err| GateError::Publish(err.error.to_string()))?;
        Ok(())
    }
}
