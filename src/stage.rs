//! Dataset staging: link the cases listed in a manifest from a shared raw
//! pool into a cohort folder.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;

use crate::utils::{NIFTI_GZ, ensure_output_folder, validate_input_folder};

#[derive(Args, Debug)]
pub struct StageArgs {
    /// CSV manifest listing the cases to stage
    #[arg(long)]
    pub manifest: PathBuf,

    /// Folder holding the raw `{id}.nii.gz` volumes
    #[arg(long)]
    pub raw_dir: PathBuf,

    /// Cohort folder the links are created in
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Only stage the first N records (quick experiments)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Manifest column holding the case identifiers
    #[arg(long, default_value = "series_uid")]
    pub column: String,
}

/// Case identifiers from `column` of a CSV manifest, in file order.
///
/// Blank identifiers are skipped.
pub fn read_manifest(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to open manifest: {path:?}"))?;
    let column_idx = reader
        .headers()
        .with_context(|| format!("Failed to read manifest header: {path:?}"))?
        .iter()
        .position(|h| h.trim() == column)
        .with_context(|| format!("Manifest {path:?} has no '{column}' column"))?;

    let mut ids = Vec::new();
    for (row_no, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Manifest {path:?} row {}", row_no + 1))?;
        match record.get(column_idx).map(str::trim) {
            Some(id) if !id.is_empty() => ids.push(id.to_string()),
            _ => warn!("Manifest row {} has no '{column}', skipping", row_no + 1),
        }
    }
    Ok(ids)
}

/// Link `{raw_dir}/{id}.nii.gz` to `{out_dir}/{id}.nii.gz`, replacing any
/// existing entry. The target is not checked.
pub fn stage_case(raw_dir: &Path, out_dir: &Path, id: &str) -> Result<PathBuf> {
    let file_name = format!("{id}{NIFTI_GZ}");
    let source = raw_dir.join(&file_name);
    let link = out_dir.join(&file_name);

    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link).with_context(|| format!("Failed to replace existing entry: {link:?}"))?;
    }
    symlink(&source, &link).with_context(|| format!("Failed to link {source:?} -> {link:?}"))?;
    Ok(link)
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}

/// Stage every manifest case (or the first `limit`) and return how many
/// links were created.
pub fn run(args: &StageArgs) -> Result<usize> {
    validate_input_folder(&args.raw_dir)?;
    ensure_output_folder(&args.out_dir)?;

    let mut ids = read_manifest(&args.manifest, &args.column)?;
    if let Some(limit) = args.limit {
        ids.truncate(limit);
    }
    println!("Staging {} case(s) from {:?} into {:?}", ids.len(), args.raw_dir, args.out_dir);

    let pb = ProgressBar::new(ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let mut staged = 0;
    for id in &ids {
        match stage_case(&args.raw_dir, &args.out_dir, id) {
            Ok(_) => staged += 1,
            Err(e) => pb.println(format!("✗ Failed to stage {id}: {e:#}")),
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!("✓ Linked {staged}/{} case(s)", ids.len());
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("use_case_record.csv");
        fs::write(&path, contents).unwrap();
        path
    }

    // =========================================================================
    // Manifest Tests
    // =========================================================================

    mod manifest {
        use super::*;

        #[test]
        fn reads_requested_column_in_order() {
            let temp_dir = TempDir::new().unwrap();
            let path = write_manifest(
                temp_dir.path(),
                "pid,series_uid,study_yr\n100,1.2.3,0\n101,1.2.4,0\n102,1.2.5,1\n",
            );
            let ids = read_manifest(&path, "series_uid").unwrap();
            assert_eq!(ids, ["1.2.3", "1.2.4", "1.2.5"]);
        }

        #[test]
        fn blank_ids_are_skipped() {
            let temp_dir = TempDir::new().unwrap();
            let path = write_manifest(temp_dir.path(), "series_uid\n1.2.3\n \n1.2.5\n");
            let ids = read_manifest(&path, "series_uid").unwrap();
            assert_eq!(ids, ["1.2.3", "1.2.5"]);
        }

        #[test]
        fn missing_column_fails() {
            let temp_dir = TempDir::new().unwrap();
            let path = write_manifest(temp_dir.path(), "pid,study_yr\n100,0\n");
            let err = read_manifest(&path, "series_uid").unwrap_err();
            assert!(err.to_string().contains("series_uid"));
        }

        #[test]
        fn missing_file_fails() {
            assert!(read_manifest(Path::new("/nonexistent/manifest.csv"), "series_uid").is_err());
        }
    }

    // =========================================================================
    // Linking Tests
    // =========================================================================

    #[cfg(unix)]
    mod linking {
        use super::*;

        #[test]
        fn link_points_into_raw_pool() {
            let temp_dir = TempDir::new().unwrap();
            let raw = temp_dir.path().join("raw");
            let out = temp_dir.path().join("out");
            fs::create_dir_all(&raw).unwrap();
            fs::create_dir_all(&out).unwrap();
            fs::write(raw.join("1.2.3.nii.gz"), b"volume").unwrap();

            let link = stage_case(&raw, &out, "1.2.3").unwrap();
            assert_eq!(link, out.join("1.2.3.nii.gz"));
            assert_eq!(fs::read_link(&link).unwrap(), raw.join("1.2.3.nii.gz"));
            assert_eq!(fs::read(&link).unwrap(), b"volume");
        }

        #[test]
        fn existing_link_is_replaced() {
            let temp_dir = TempDir::new().unwrap();
            let out = temp_dir.path().join("out");
            fs::create_dir_all(&out).unwrap();

            stage_case(Path::new("/old/pool"), &out, "1.2.3").unwrap();
            let link = stage_case(Path::new("/new/pool"), &out, "1.2.3").unwrap();
            assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("/new/pool/1.2.3.nii.gz"));
        }

        #[test]
        fn dangling_targets_are_not_checked() {
            let temp_dir = TempDir::new().unwrap();
            let link = stage_case(Path::new("/nonexistent/pool"), temp_dir.path(), "9.9.9").unwrap();
            assert!(fs::symlink_metadata(&link).is_ok());
            assert!(!link.exists());
        }

        #[test]
        fn run_respects_limit() {
            let temp_dir = TempDir::new().unwrap();
            let raw = temp_dir.path().join("raw");
            fs::create_dir_all(&raw).unwrap();
            let manifest = write_manifest(temp_dir.path(), "series_uid\na\nb\nc\n");
            let args = StageArgs {
                manifest,
                raw_dir: raw,
                out_dir: temp_dir.path().join("cohort").join("data").join("nifti"),
                limit: Some(2),
                column: "series_uid".to_string(),
            };

            assert_eq!(run(&args).unwrap(), 2);
            assert!(fs::symlink_metadata(args.out_dir.join("a.nii.gz")).is_ok());
            assert!(fs::symlink_metadata(args.out_dir.join("b.nii.gz")).is_ok());
            assert!(fs::symlink_metadata(args.out_dir.join("c.nii.gz")).is_err());
        }
    }
}
