//! Companion binary provisioning.
//!
//! Some agents need a helper executable next to them (a tool server, a
//! browser driver). [`BinaryDownload`] fetches it on first use and is run
//! as a [`SetupStep`] before the agent is spawned.

use crate::provider::SetupStep;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("download request failed: {0}")]
    Request(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Downloads a file from `url` to `destination` if it is not there yet.
///
/// Concurrent tasks share one instance, so the download runs at most once
/// at a time and later callers see the finished file.
#[derive(Debug)]
pub struct BinaryDownload {
    name: String,
    url: String,
    destination: PathBuf,
    lock: Mutex<()>,
}

impl BinaryDownload {
    pub fn new(name: impl Into<String>, url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            destination: destination.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn is_installed(&self) -> bool {
        self.destination.is_file()
    }

    /// Make sure the binary is present, downloading it if necessary.
    pub fn ensure(&self, report: &dyn Fn(&str)) -> Result<PathBuf, ProvisionError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_installed() {
            return Ok(self.destination.clone());
        }

        log::info!("downloading {} from {}", self.name, self.url);
        report(&format!("Downloading {}...", self.name));

        let response = ureq::get(&self.url)
            .call()
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        let total = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());

        let partial = partial_path(&self.destination);
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent).map_err(|source| ProvisionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let result = self.copy_with_progress(response.into_reader(), &partial, total, report);
        if let Err(err) = result {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }

        fs::rename(&partial, &self.destination).map_err(|source| ProvisionError::Io {
            path: self.destination.clone(),
            source,
        })?;
        make_executable(&self.destination)?;

        log::info!("{} installed at {}", self.name, self.destination.display());
        Ok(self.destination.clone())
    }

    fn copy_with_progress(
        &self,
        mut reader: impl Read,
        partial: &Path,
        total: Option<u64>,
        report: &dyn Fn(&str),
    ) -> Result<(), ProvisionError> {
        let io_err = |source| ProvisionError::Io {
            path: partial.to_path_buf(),
            source,
        };
        let mut file = File::create(partial).map_err(io_err)?;
        let mut buf = [0u8; 64 * 1024];
        let mut downloaded = 0u64;
        let mut last_reported = 0u8;

        loop {
            let n = reader.read(&mut buf).map_err(io_err)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).map_err(io_err)?;
            downloaded += n as u64;

            if let Some(percent) = progress_milestone(downloaded, total, last_reported) {
                last_reported = percent;
                report(&format!("Downloading {}... {}%", self.name, percent));
            }
        }

        file.flush().map_err(io_err)
    }
}

impl SetupStep for BinaryDownload {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, report: &dyn Fn(&str)) -> Result<(), String> {
        self.ensure(report).map(|_| ()).map_err(|e| e.to_string())
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Next 10% step reached, if any.
fn progress_milestone(downloaded: u64, total: Option<u64>, last_reported: u8) -> Option<u8> {
    let total = total.filter(|t| *t > 0)?;
    let percent = (downloaded.saturating_mul(100) / total).min(100) as u8;
    let step = percent / 10 * 10;
    (step > last_reported).then_some(step)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
        ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[test]
    fn installed_binary_is_not_downloaded() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("helper");
        fs::write(&dest, "bin").unwrap();

        // The URL is unreachable; success proves no request was made.
        let step = BinaryDownload::new("helper", "http://127.0.0.1:1/helper", &dest);
        let reports = RefCell::new(Vec::new());
        let path = step.ensure(&|line| reports.borrow_mut().push(line.to_string())).unwrap();

        assert_eq!(path, dest);
        assert!(reports.borrow().is_empty());
    }

    #[test]
    fn bad_url_is_request_error() {
        let dir = tempdir().unwrap();
        let step = BinaryDownload::new("helper", "not a url", dir.path().join("helper"));

        let err = step.ensure(&|_| {}).unwrap_err();
        assert!(matches!(err, ProvisionError::Request(_)));
        assert!(!step.is_installed());
        assert!(!partial_path(step.destination()).exists());
    }

    #[test]
    fn setup_step_reports_name_and_error_text() {
        let step = BinaryDownload::new("helper", "not a url", "/tmp/conductor-helper-test");
        assert_eq!(SetupStep::name(&step), "helper");
        let err = step.run(&|_| {}).unwrap_err();
        assert!(err.starts_with("download request failed"));
    }

    #[test]
    fn copy_reports_every_ten_percent() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("helper.part");
        let step = BinaryDownload::new("helper", "unused", dir.path().join("helper"));
        let data = vec![7u8; 200 * 1024];
        let reports = RefCell::new(Vec::new());

        step.copy_with_progress(
            data.as_slice(),
            &partial,
            Some(data.len() as u64),
            &|line| reports.borrow_mut().push(line.to_string()),
        )
        .unwrap();

        assert_eq!(fs::read(&partial).unwrap().len(), data.len());
        let reports = reports.into_inner();
        assert!(!reports.is_empty());
        assert_eq!(reports.last().unwrap(), "Downloading helper... 100%");
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/opt/bin/helper.exe")),
            PathBuf::from("/opt/bin/helper.exe.part")
        );
    }

    #[test]
    fn milestones() {
        assert_eq!(progress_milestone(5, Some(100), 0), None);
        assert_eq!(progress_milestone(10, Some(100), 0), Some(10));
        assert_eq!(progress_milestone(15, Some(100), 10), None);
        assert_eq!(progress_milestone(100, Some(100), 90), Some(100));
        assert_eq!(progress_milestone(100, None, 0), None);
        assert_eq!(progress_milestone(100, Some(0), 0), None);
    }
}
