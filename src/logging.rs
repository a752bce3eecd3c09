use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// A `MakeWriter` that discards writes until a file is attached through its
/// [`DeferredFileHandle`].
///
/// The subscriber is installed before the config is read, so the VM
/// directory (and with it `vemu.log`) is not known yet.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`, creating parent directories as needed.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        match self.inner.lock() {
            Ok(mut guard) => *guard = Some(file),
            Err(poisoned) => *poisoned.into_inner() = Some(file),
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.lock().map_err(|_| std::io::Error::other("log writer poisoned"))?;
        match guard.as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.inner.lock().map_err(|_| std::io::Error::other("log writer poisoned"))?;
        match guard.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn writes_are_dropped_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vms/dev/vemu.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"early\n").unwrap();
        assert!(!handle.is_active());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"late\n").unwrap();

        assert!(handle.is_active());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "late\n");
    }

    #[test]
    fn activation_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vemu.log");
        std::fs::write(&path, "previous run\n").unwrap();
        let (writer, handle) = DeferredFileWriter::new();

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"this run\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "previous run\nthis run\n"
        );
    }
}
