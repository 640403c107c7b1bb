// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Destination browsing and direct uploads.
//!
//! Both helpers back the destination picker of a UI: listing a folder so the
//! user can navigate to a download target, and dropping a local file into a
//! folder without going through either download backend.

use std::fs;
use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::error::JobError;
use crate::paths::{basename, expand_path, prepare_destination};

/// Fallback name for uploads without a usable filename.
const DEFAULT_UPLOAD_NAME: &str = "upload.bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
}

/// Listing of one directory. Failures are reported inside the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirListing {
    pub ok: bool,
    pub root: String,
    pub sep: String,
    pub folders: Vec<DirEntry>,
    pub files: Vec<DirEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// List folders and files under `raw`, each sorted by name.
pub fn list_dir(raw: &str) -> DirListing {
    let root = expand_path(raw);
    let mut listing = DirListing {
        ok: true,
        root: root.to_string_lossy().into_owned(),
        sep: std::path::MAIN_SEPARATOR.to_string(),
        folders: Vec::new(),
        files: Vec::new(),
        error: None,
    };

    if let Err(message) = read_entries(&root, &mut listing) {
        tracing::debug!(root = %listing.root, error = %message, "Directory listing failed");
        listing.ok = false;
        listing.error = Some(message);
        listing.folders.clear();
        listing.files.clear();
    }
    listing
}

fn read_entries(root: &Path, listing: &mut DirListing) -> Result<(), String> {
    if !root.exists() {
        return Err("Path does not exist".to_string());
    }
    if !root.is_dir() {
        return Err("Not a directory".to_string());
    }

    let mut folders = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| e.to_string())? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        // Follows symlinks; entries we cannot stat are skipped.
        let Ok(meta) = fs::metadata(&path) else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        if meta.is_dir() {
            folders.push(name);
        } else {
            files.push(name);
        }
    }
    folders.sort();
    files.sort();

    let to_entries = |names: Vec<String>| -> Vec<DirEntry> {
        names
            .into_iter()
            .map(|name| DirEntry {
                path: root.join(&name).to_string_lossy().into_owned(),
                name,
            })
            .collect()
    };
    listing.folders = to_entries(folders);
    listing.files = to_entries(files);
    Ok(())
}

/// Result of a saved upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSaved {
    pub ok: bool,
    pub filename: String,
    pub path: String,
    pub bytes: u64,
}

/// Basename of a client-supplied filename, safe to create on any platform.
pub fn upload_filename(raw: &str) -> String {
    let base: String = basename(raw)
        .chars()
        .map(|c| match c {
            '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    match base.as_str() {
        "" | "." | ".." => DEFAULT_UPLOAD_NAME.to_string(),
        _ => base,
    }
}

/// Where the file part goes while the destination is still unknown.
enum Pending {
    Empty,
    Spooled {
        filename: String,
        spool: NamedTempFile,
        bytes: u64,
    },
    Written(UploadSaved),
}

/// Save the `file` part of a multipart upload into the `dest_dir` part.
///
/// When `dest_dir` precedes the file the data is streamed straight to its
/// destination; otherwise it is spooled to a temporary file and moved into
/// place once the destination is known.
pub async fn save_upload(mut multipart: Multipart) -> Result<UploadSaved, JobError> {
    let mut dest_raw: Option<String> = None;
    let mut pending = Pending::Empty;

    while let Some(mut field) = multipart.next_field().await.map_err(invalid_upload)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("dest_dir") => {
                dest_raw = Some(field.text().await.map_err(invalid_upload)?);
            }
            Some("file") => {
                let filename = upload_filename(field.file_name().unwrap_or(DEFAULT_UPLOAD_NAME));
                match dest_raw.as_deref() {
                    Some(raw) => {
                        let path = target_path(raw, &filename)?;
                        let file = tokio::fs::File::create(&path).await.map_err(write_failed)?;
                        let bytes = copy_field(&mut field, file).await?;
                        pending = Pending::Written(saved(filename, &path, bytes));
                    }
                    None => {
                        let spool = spool_file()?;
                        let file = tokio::fs::File::from_std(spool.reopen().map_err(write_failed)?);
                        let bytes = copy_field(&mut field, file).await?;
                        tracing::debug!(spool = %spool.path().display(), bytes, "Upload spooled");
                        pending = Pending::Spooled { filename, spool, bytes };
                    }
                }
            }
            _ => {}
        }
    }

    let result = match pending {
        Pending::Empty => Err(JobError::invalid("No file selected. Please choose a file.")),
        Pending::Written(done) => Ok(done),
        Pending::Spooled { filename, spool, bytes } => {
            let raw = dest_raw.as_deref().unwrap_or("");
            let path = target_path(raw, &filename)?;
            move_into_place(spool, &path).await?;
            Ok(saved(filename, &path, bytes))
        }
    }?;

    tracing::info!(path = %result.path, bytes = result.bytes, "Upload saved");
    Ok(result)
}

fn target_path(dest_raw: &str, filename: &str) -> Result<PathBuf, JobError> {
    if dest_raw.trim().is_empty() {
        return Err(JobError::invalid(
            "Destination folder is empty. Please enter a folder.",
        ));
    }
    Ok(prepare_destination(dest_raw)?.join(filename))
}

fn saved(filename: String, path: &Path, bytes: u64) -> UploadSaved {
    UploadSaved {
        ok: true,
        filename,
        path: path.to_string_lossy().into_owned(),
        bytes,
    }
}

fn invalid_upload(e: impl std::fmt::Display) -> JobError {
    JobError::invalid(format!("Invalid upload: {}", e))
}

fn write_failed(e: impl std::fmt::Display) -> JobError {
    JobError::Internal(format!("Write failed: {}", e))
}

/// Temporary file in the system temp dir, removed on drop unless persisted.
fn spool_file() -> Result<NamedTempFile, JobError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".fetchhub-upload-");
    // Same mode as a freshly created file once the umask applies.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    builder.tempfile().map_err(write_failed)
}

async fn copy_field(
    field: &mut axum::extract::multipart::Field<'_>,
    mut file: tokio::fs::File,
) -> Result<u64, JobError> {
    let mut total = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(invalid_upload)? {
        file.write_all(&chunk).await.map_err(write_failed)?;
        total += chunk.len() as u64;
    }
    file.flush().await.map_err(write_failed)?;
    Ok(total)
}

/// Rename the spool onto `path`, copying when the two sit on different devices.
async fn move_into_place(spool: NamedTempFile, path: &Path) -> Result<(), JobError> {
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || match spool.persist(&target) {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e.error, "Rename failed; copying upload into place");
            fs::copy(e.file.path(), &target).map(|_| ())
        }
    })
    .await
    .map_err(write_failed)?
    .map_err(write_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upload_filename() {
        assert_eq!(upload_filename("photo.png"), "photo.png");
        assert_eq!(upload_filename(r"C:\Users\me\a?b.txt"), "a_b.txt");
        assert_eq!(upload_filename("../../etc/passwd"), "passwd");
        assert_eq!(upload_filename("we|rd\u{1}.bin"), "we_rd_.bin");
        assert_eq!(upload_filename(""), "upload.bin");
        assert_eq!(upload_filename(".."), "upload.bin");
        assert_eq!(upload_filename("with space.txt"), "with space.txt");
    }

    #[test]
    fn test_list_dir_sorted() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("zeta")).unwrap();
        fs::create_dir(tmp.path().join("alpha")).unwrap();
        fs::write(tmp.path().join("b.txt"), b"").unwrap();
        fs::write(tmp.path().join("a.txt"), b"").unwrap();

        let listing = list_dir(tmp.path().to_str().unwrap());
        assert!(listing.ok);
        assert_eq!(listing.error, None);
        let folders: Vec<_> = listing.folders.iter().map(|e| e.name.as_str()).collect();
        let files: Vec<_> = listing.files.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(folders, ["alpha", "zeta"]);
        assert_eq!(files, ["a.txt", "b.txt"]);
        assert_eq!(
            listing.folders[0].path,
            tmp.path().join("alpha").to_string_lossy()
        );
    }

    #[test]
    fn test_list_dir_missing() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        let listing = list_dir(missing.to_str().unwrap());
        assert!(!listing.ok);
        assert_eq!(listing.error.as_deref(), Some("Path does not exist"));
        assert_eq!(listing.root, missing.to_string_lossy());
        assert!(listing.folders.is_empty() && listing.files.is_empty());
    }

    #[test]
    fn test_list_dir_on_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();
        let listing = list_dir(file.to_str().unwrap());
        assert_eq!(listing.error.as_deref(), Some("Not a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_dir_skips_broken_symlink() {
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), tmp.path().join("dangling")).unwrap();
        fs::write(tmp.path().join("real.txt"), b"").unwrap();
        let listing = list_dir(tmp.path().to_str().unwrap());
        let files: Vec<_> = listing.files.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(files, ["real.txt"]);
    }
}
