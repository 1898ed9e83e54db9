//! Wrapper around the external `rdiffdir`-style delta tool.
//!
//! The tool itself is an opaque collaborator: it produces signature and
//! delta byte blobs and applies patches in place. This module shells out to
//! it, compresses the blobs for transport and manages the temporary files
//! the tool reads from.

use color_eyre::eyre::{eyre, Report, WrapErr};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const RDIFF_BIN: &str = "rdiffdir";

pub fn compress(bytes: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(bytes)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, Report> {
    lz4_flex::decompress_size_prepended(bytes)
        .wrap_err("error while decompressing blob")
}

/// Produces the compressed signature of `path`, creating the path first if
/// it does not exist (a directory or an empty file per `is_dir`).
pub async fn dir_sig(path: &Path, is_dir: bool) -> Result<Vec<u8>, Report> {
    if !path.exists() {
        if is_dir {
            tokio::fs::create_dir_all(path)
                .await
                .wrap_err_with(|| format!("failed to create {:?}", path))?;
        } else {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    tokio::fs::create_dir_all(parent).await.wrap_err_with(
                        || format!("failed to create {:?}", parent),
                    )?;
                }
            }
            tokio::fs::File::create(path)
                .await
                .wrap_err_with(|| format!("failed to create {:?}", path))?;
        }
    }
    let stdout = run_capture(&["sig", &path_arg(path)?, "-"]).await?;
    Ok(compress(&stdout))
}

/// Computes the compressed delta that takes a tree with signature `sig` to
/// the local contents of `new_path`.
pub async fn dir_delta(sig: &[u8], new_path: &Path) -> Result<Vec<u8>, Report> {
    let sig_file = write_temp(&decompress(sig)?)?;
    let sig_path = path_arg(sig_file.path())?;
    let stdout =
        run_capture(&["delta", &sig_path, &path_arg(new_path)?, "-"]).await?;
    Ok(compress(&stdout))
}

/// Applies a compressed delta to `path` in place.
pub async fn dir_patch(path: &Path, delta: &[u8]) -> Result<(), Report> {
    let delta_file = write_temp(&decompress(delta)?)?;
    let delta_path = path_arg(delta_file.path())?;
    run_capture(&["patch", &path_arg(path)?, &delta_path]).await?;
    Ok(())
}

fn write_temp(bytes: &[u8]) -> Result<tempfile::NamedTempFile, Report> {
    use std::io::Write;
    let mut file =
        tempfile::NamedTempFile::new().wrap_err("failed to create temp file")?;
    file.write_all(bytes)
        .wrap_err("failed to write temp file")?;
    Ok(file)
}

fn path_arg(path: &Path) -> Result<String, Report> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| eyre!("non-utf8 path: {:?}", path))
}

async fn run_capture(args: &[&str]) -> Result<Vec<u8>, Report> {
    let output = Command::new(RDIFF_BIN)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .output()
        .await
        .wrap_err_with(|| format!("failed to run {} {:?}", RDIFF_BIN, args))?;
    if !output.status.success() {
        return Err(eyre!(
            "{} {:?} exited with {}",
            RDIFF_BIN,
            args,
            output.status
        ));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_roundtrip() {
        let blob: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&blob);
        assert!(compressed.len() < blob.len());
        assert_eq!(decompress(&compressed).unwrap(), blob);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(&[1, 2, 3]).is_err());
    }

    // Requires the external delta tool; run with `cargo test -- --ignored`
    // on a host that has it installed.
    #[tokio::test]
    #[ignore]
    async fn sig_delta_patch_law() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"new contents").unwrap();
        std::fs::write(dst.path().join("a.txt"), b"old").unwrap();

        let sig = dir_sig(dst.path(), true).await.unwrap();
        let delta = dir_delta(&sig, src.path()).await.unwrap();
        dir_patch(dst.path(), &delta).await.unwrap();

        let patched = std::fs::read(dst.path().join("a.txt")).unwrap();
        assert_eq!(patched, b"new contents");
    }
}
