//! Fetching raw dataset tables over HTTP.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{info, warn};

/// Download `url` to `destination`, streaming through a `.part` file so an interrupted
/// transfer never leaves a truncated table behind.
pub fn download_to(url: &str, destination: &Path, force: bool) -> Result<u64> {
    anyhow::ensure!(
        force || !destination.exists(),
        "{} already exists; pass --force to replace it",
        destination.display()
    );
    let dir = destination
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    anyhow::ensure!(
        dir.is_dir(),
        "raw directory {} does not exist; run `emrec setup` first",
        dir.display()
    );

    info!("Downloading {url}");
    let response = match ureq::get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            anyhow::bail!(
                "download of {url} failed with HTTP {code} {}",
                response.status_text()
            )
        }
        Err(ureq::Error::Transport(transport)) => {
            anyhow::bail!("download of {url} failed: {transport}")
        }
    };

    let partial = partial_path(destination);
    let written = write_partial(&mut response.into_reader(), &partial)?;
    fs::rename(&partial, destination).with_context(|| {
        format!(
            "failed to move {} to {}",
            partial.display(),
            destination.display()
        )
    })?;
    info!("Saved {written} bytes to {}", destination.display());
    Ok(written)
}

/// Stream `reader` into `partial`, removing the file again if the copy fails.
fn write_partial(reader: &mut impl Read, partial: &Path) -> Result<u64> {
    let mut file =
        File::create(partial).with_context(|| format!("failed to create {}", partial.display()))?;
    match io::copy(reader, &mut file) {
        Ok(written) => Ok(written),
        Err(err) => {
            drop(file);
            if let Err(cleanup) = fs::remove_file(partial) {
                warn!("failed to remove {}: {cleanup}", partial.display());
            }
            Err(err).with_context(|| format!("failed while writing {}", partial.display()))
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_sits_next_to_destination() {
        assert_eq!(
            partial_path(Path::new("datasets/raw/fer2013.csv")),
            Path::new("datasets/raw/fer2013.csv.part")
        );
    }

    /// Yields a few bytes, then fails like a dropped connection.
    struct BrokenReader {
        sent: bool,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.sent = true;
            let chunk = b"emotion,pixels,Usage\n";
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    #[test]
    fn interrupted_transfer_leaves_no_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let partial = dir.path().join("fer2013.csv.part");
        let err = write_partial(&mut BrokenReader { sent: false }, &partial)
            .expect_err("reader fails mid-stream");
        assert!(format!("{err:#}").contains("reset"));
        assert!(!partial.exists());
    }

    #[test]
    fn complete_transfer_reports_bytes_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let partial = dir.path().join("fer2013.csv.part");
        let written = write_partial(&mut &b"emotion,pixels,Usage\n"[..], &partial).expect("copy");
        assert_eq!(written, 21);
        assert_eq!(fs::read(&partial).expect("read"), b"emotion,pixels,Usage\n");
    }

    #[test]
    fn existing_file_requires_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("fer2013.csv");
        fs::write(&target, "emotion,pixels,Usage\n").expect("write");
        let err = download_to("http://127.0.0.1:9/fer2013.csv", &target, false)
            .expect_err("existing file");
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("missing/fer2013.csv");
        let err = download_to("http://127.0.0.1:9/fer2013.csv", &target, false)
            .expect_err("no raw dir");
        assert!(err.to_string().contains("emrec setup"));
    }
}
