use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::GateError;

/// One object as reported by a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Read access to submitted objects.
pub trait ObjectStore: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, GateError>;

    fn head_size(&self, bucket: &str, key: &str) -> Result<u64, GateError>;

    /// Every object currently in `bucket`, in no particular order.
    fn list(&self, bucket: &str) -> Result<Vec<ObjectSummary>, GateError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<T> {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, GateError> {
        (**self).get(bucket, key)
    }

    fn head_size(&self, bucket: &str, key: &str) -> Result<u64, GateError> {
        (**self).head_size(bucket, key)
    }

    fn list(&self, bucket: &str) -> Result<Vec<ObjectSummary>, GateError> {
        (**self).list(bucket)
    }
}

/// Buckets as directories under one root: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: Utf8PathBuf,
}

impl LocalStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<Utf8PathBuf, GateError> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket.starts_with('.') {
            return Err(GateError::Filesystem(format!("invalid bucket name {bucket}")));
        }
        Ok(self.root.join(bucket))
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<Utf8PathBuf, GateError> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let relative = Utf8Path::new(key);
        let escapes = relative.components().any(|component| {
            !matches!(component, camino::Utf8Component::Normal(_))
        });
        if key.is_empty() || escapes {
            return Err(GateError::Filesystem(format!("invalid object key {key}")));
        }
        Ok(bucket_dir.join(relative))
    }

    /// Writes an object, replacing any existing one.
    pub fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), GateError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GateError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| GateError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| GateError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Names of the bucket directories under the root.
    pub fn buckets(&self) -> Result<Vec<String>, GateError> {
        let mut buckets = Vec::new();
        let entries = self
            .root
            .read_dir_utf8()
            .map_err(|err| GateError::Filesystem(format!("{}: {err}", self.root)))?;
        for entry in entries {
            let entry = entry.map_err(|err| GateError::Filesystem(err.to_string()))?;
            let is_dir = entry
                .file_type()
                .map_err(|err| GateError::Filesystem(err.to_string()))?
                .is_dir();
            if is_dir && !entry.file_name().starts_with('.') {
                buckets.push(entry.file_name().to_string());
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    fn collect_objects(
        &self,
        bucket: &str,
        bucket_dir: &Utf8Path,
        dir: &Utf8Path,
        objects: &mut Vec<ObjectSummary>,
    ) -> Result<(), GateError> {
        let entries = dir
            .read_dir_utf8()
            .map_err(|err| GateError::TransientIo(format!("{dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| GateError::TransientIo(err.to_string()))?;
            let path = entry.path();
            let metadata = entry
                .metadata()
                .map_err(|err| GateError::TransientIo(format!("{path}: {err}")))?;
            if metadata.is_dir() {
                self.collect_objects(bucket, bucket_dir, path, objects)?;
                continue;
            }
            // Half-written puts.
            if path.extension() == Some("tmp") {
                continue;
            }
            let key = path
                .strip_prefix(bucket_dir)
                .map_err(|err| GateError::Filesystem(err.to_string()))?
                .components()
                .map(|component| component.as_str())
                .collect::<Vec<_>>()
                .join("/");
            let content = fs::read(path.as_std_path()).map_err(|err| self.map_io(bucket, &key, err))?;
            let last_modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .map_err(|err| GateError::Filesystem(format!("{path}: {err}")))?;
            objects.push(ObjectSummary {
                etag: content_etag(&content),
                size: metadata.len(),
                last_modified,
                key,
            });
        }
        Ok(())
    }

    fn map_io(&self, bucket: &str, key: &str, err: io::Error) -> GateError {
        match err.kind() {
            io::ErrorKind::NotFound => GateError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => GateError::TransientIo(format!("{bucket}/{key}: {err}")),
        }
    }
}

impl ObjectStore for LocalStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, GateError> {
        let path = self.object_path(bucket, key)?;
        fs::read(path.as_std_path()).map_err(|err| self.map_io(bucket, key, err))
    }

    fn head_size(&self, bucket: &str, key: &str) -> Result<u64, GateError> {
        let path = self.object_path(bucket, key)?;
        fs::metadata(path.as_std_path())
            .map(|metadata| metadata.len())
            .map_err(|err| self.map_io(bucket, key, err))
    }

    fn list(&self, bucket: &str) -> Result<Vec<ObjectSummary>, GateError> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut objects = Vec::new();
        self.collect_objects(bucket, &dir, &dir, &mut objects)?;
        Ok(objects)
    }
}

/// Local objects carry no etag; the content digest stands in for one.
pub fn content_etag(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}
