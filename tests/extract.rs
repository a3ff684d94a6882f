mod common;

use std::fs;

use assert_matches::assert_matches;

use skydata_manager::error::SkyDataError;
use skydata_manager::extract::{ArchiveExtractor, ExtractOutcome};
use skydata_manager::task::CancelToken;

use common::{tar_gz, tar_gz_raw_name};

fn write_archive(dir: &std::path::Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn archives_sharing_a_parent_merge_into_it() {
    let dir = tempfile::tempdir().unwrap();
    let data_root = dir.path().join("data");
    fs::create_dir_all(data_root.join("stars")).unwrap();
    fs::write(data_root.join("stars/keep.txt"), b"untouched").unwrap();

    let first = write_archive(
        dir.path(),
        "hip.tar.gz",
        &tar_gz(&[("stars/hip/hip.bin", b"hip"), ("stars/hip/hip.json", b"{}")]),
    );
    let second = write_archive(
        dir.path(),
        "tycho.tar.gz",
        &tar_gz(&[("stars/tycho/tycho.bin", b"tycho")]),
    );

    let outcome =
        ArchiveExtractor::extract(&first, &data_root, &CancelToken::new(), &mut |_| {}).unwrap();
    assert_eq!(
        outcome,
        ExtractOutcome::Completed {
            files: 2,
            bytes_written: 5
        }
    );
    ArchiveExtractor::extract(&second, &data_root, &CancelToken::new(), &mut |_| {}).unwrap();

    assert_eq!(fs::read(data_root.join("stars/hip/hip.bin")).unwrap(), b"hip");
    assert_eq!(fs::read(data_root.join("stars/tycho/tycho.bin")).unwrap(), b"tycho");
    assert_eq!(fs::read(data_root.join("stars/keep.txt")).unwrap(), b"untouched");
}

#[test]
fn directory_entries_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    builder
        .append_data(&mut header, "nebulae/", std::io::empty())
        .unwrap();
    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "nebulae/m42.png", &b"m42!"[..])
        .unwrap();
    let bytes = builder.into_inner().unwrap().finish().unwrap();
    let archive = write_archive(dir.path(), "nebulae.tar.gz", &bytes);

    let data_root = dir.path().join("data");
    let outcome =
        ArchiveExtractor::extract(&archive, &data_root, &CancelToken::new(), &mut |_| {}).unwrap();

    assert_matches!(outcome, ExtractOutcome::Completed { files: 1, .. });
    assert_eq!(fs::read(data_root.join("nebulae/m42.png")).unwrap(), b"m42!");
}

#[test]
fn progress_is_monotonic_and_ends_at_total() {
    let dir = tempfile::tempdir().unwrap();
    let noisy = (0..2_000_000u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect::<Vec<_>>();
    let bytes = tar_gz(&[("dso/a.bin", &noisy), ("dso/b.bin", &noisy[..700_000])]);
    let archive = write_archive(dir.path(), "dso.tar.gz", &bytes);

    let mut reports = Vec::new();
    ArchiveExtractor::extract(
        &archive,
        &dir.path().join("data"),
        &CancelToken::new(),
        &mut |progress| reports.push(progress),
    )
    .unwrap();

    assert!(
        reports
            .windows(2)
            .all(|pair| pair[0].compressed_read <= pair[1].compressed_read)
    );
    let last = reports.last().unwrap();
    assert_eq!(last.compressed_read, bytes.len() as u64);
    assert_eq!(last.compressed_total, bytes.len() as u64);
    assert_eq!(last.percent, 100.0);
}

#[test]
fn parent_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(
        dir.path(),
        "evil.tar.gz",
        &tar_gz_raw_name("../evil.txt", b"owned"),
    );
    let data_root = dir.path().join("data");

    let result = ArchiveExtractor::extract(&archive, &data_root, &CancelToken::new(), &mut |_| {});

    assert_matches!(result, Err(SkyDataError::Extraction(reason)) if reason.contains("escapes"));
    assert!(!dir.path().join("evil.txt").exists());
}

#[test]
fn corrupt_archive_is_an_extraction_error() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "broken.tar.gz", b"\x1f\x8b\x08garbage");
    let result = ArchiveExtractor::extract(
        &archive,
        &dir.path().join("data"),
        &CancelToken::new(),
        &mut |_| {},
    );
    assert_matches!(result, Err(SkyDataError::Extraction(_)));
}

#[test]
fn cancelled_before_start_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "hip.tar.gz", &tar_gz(&[("hip/a.bin", b"a")]));
    let data_root = dir.path().join("data");
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = ArchiveExtractor::extract(&archive, &data_root, &cancel, &mut |_| {}).unwrap();

    assert_eq!(outcome, ExtractOutcome::Cancelled);
    assert!(!data_root.join("hip/a.bin").exists());
}
