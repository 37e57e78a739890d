use exif_runtime::{EngineConfig, Error, ExifTool, WriteStatus};
use exif_wasm_engine::stub::{StubGuest, OUTPUT_SUFFIX, STDERR_LINE};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn session(stub: StubGuest) -> ExifTool {
    ExifTool::from_module_bytes(&stub.module_bytes(), &EngineConfig::default()).unwrap()
}

fn source_file(temp_dir: &Path, contents: &[u8]) -> PathBuf {
    let path = temp_dir.join("photo.jpg");
    fs::write(&path, contents).unwrap();
    path
}

fn tags(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn scratch_entries(exiftool: &ExifTool) -> Vec<String> {
    let scratch = exiftool.scratch_root().unwrap().join("scratch");
    fs::read_dir(scratch)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn read_metadata_decodes_guest_json() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"\xff\xd8\xff\xd9");
    let exiftool = session(StubGuest::responding(
        r#"{"FileType":"JPEG","MIMEType":"image/jpeg","ImageWidth":8,"ThumbnailImage":"[binary data]"}"#,
    ));

    let record = exiftool.read_metadata(&src).unwrap();
    assert_eq!(record.get_str("FileType"), Some("JPEG"));
    assert_eq!(record.get_str("MIMEType"), Some("image/jpeg"));
    assert_eq!(record.get_i64("ImageWidth"), Some(8));
    assert!(record.is_binary("ThumbnailImage"));

    assert!(scratch_entries(&exiftool).is_empty());
}

#[test]
fn read_metadata_reports_unparseable_output() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"data");
    let exiftool = session(StubGuest::echo());

    match exiftool.read_metadata(&src).unwrap_err() {
        Error::ResultDecode { output, .. } => assert!(output.contains("ImageInfo('/tmp/input')")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(scratch_entries(&exiftool).is_empty());
}

#[test]
fn missing_source_file_is_a_file_error() {
    let temp_dir = TempDir::new().unwrap();
    let exiftool = session(StubGuest::responding("{}"));
    let missing = temp_dir.path().join("missing.jpg");

    match exiftool.read_metadata(&missing).unwrap_err() {
        Error::File { operation, path, source } => {
            assert_eq!(operation, "read source file");
            assert_eq!(path, missing);
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = exiftool
        .set_tag(&missing, None, "Artist", "nobody")
        .unwrap_err();
    assert!(matches!(err, Error::File { .. }));
}

#[test]
fn write_metadata_saves_guest_output_to_destination() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let dst = temp_dir.path().join("tagged.jpg");
    let exiftool = session(StubGuest::responding("1").copying_input());

    let status = exiftool
        .write_metadata(
            &src,
            Some(dst.as_path()),
            &tags(json!({"Artist": "O'Brien", "Copyright": "C:\\2024"})),
        )
        .unwrap();
    assert_eq!(status, WriteStatus::Written);

    let mut expected = b"original".to_vec();
    expected.extend_from_slice(OUTPUT_SUFFIX);
    assert_eq!(fs::read(&dst).unwrap(), expected);
    assert_eq!(fs::read(&src).unwrap(), b"original");
    assert!(scratch_entries(&exiftool).is_empty());
}

#[test]
fn write_without_destination_rewrites_source() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let exiftool = session(StubGuest::responding("2").copying_input());

    let status = exiftool.set_tag(&src, None, "Artist", "Jane").unwrap();
    assert_eq!(status, WriteStatus::WrittenWithWarnings);

    let mut expected = b"original".to_vec();
    expected.extend_from_slice(OUTPUT_SUFFIX);
    assert_eq!(fs::read(&src).unwrap(), expected);

    // An empty destination also means in place.
    exiftool.set_tag(&src, Some(Path::new("")), "Artist", "Jane").unwrap();
    expected.extend_from_slice(OUTPUT_SUFFIX);
    assert_eq!(fs::read(&src).unwrap(), expected);
}

#[test]
fn rejected_write_leaves_destination_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let dst = temp_dir.path().join("tagged.jpg");
    let exiftool = session(StubGuest::responding("0").copying_input());

    match exiftool.set_tag(&src, Some(dst.as_path()), "Bogus", 1).unwrap_err() {
        Error::WriteRejected { stderr } => assert_eq!(stderr, STDERR_LINE),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!dst.exists());
    assert_eq!(fs::read(&src).unwrap(), b"original");
    assert!(scratch_entries(&exiftool).is_empty());
}

#[test]
fn unexpected_write_result_is_a_decode_error() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let dst = temp_dir.path().join("tagged.jpg");
    let exiftool = session(StubGuest::responding("maybe"));

    let err = exiftool.set_tag(&src, Some(dst.as_path()), "Artist", "x").unwrap_err();
    assert!(matches!(err, Error::ResultDecode { ref output, .. } if output == "maybe"));
    assert!(!dst.exists());
}

#[test]
fn version_is_trimmed() {
    let exiftool = session(StubGuest::responding("13.10\n"));
    assert_eq!(exiftool.version().unwrap(), "13.10");
}

#[test]
fn close_is_idempotent_and_removes_scratch() {
    let exiftool = session(StubGuest::responding("13.10"));
    let root = exiftool.scratch_root().unwrap();
    assert!(root.exists());

    exiftool.close().unwrap();
    assert!(!root.exists());
    assert!(exiftool.is_closed());
    assert!(exiftool.scratch_root().is_none());

    exiftool.close().unwrap();
    assert!(matches!(exiftool.version(), Err(Error::Closed)));
    assert!(matches!(exiftool.read_metadata("any.jpg"), Err(Error::File { .. })));
}

#[test]
fn operations_after_close_fail_with_closed() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let exiftool = session(StubGuest::responding("{}"));
    exiftool.close().unwrap();

    assert!(matches!(exiftool.read_metadata(&src), Err(Error::Closed)));
    assert!(matches!(
        exiftool.set_tag(&src, None, "Artist", "x"),
        Err(Error::Closed)
    ));
}

#[test]
fn drop_tears_down_unclosed_session() {
    let exiftool = session(StubGuest::echo());
    let root = exiftool.scratch_root().unwrap();
    drop(exiftool);
    assert!(!root.exists());
}

#[test]
fn concurrent_calls_never_see_each_others_output() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let exiftool = Arc::new(session(StubGuest::echo().with_unwinds(2)));

    let handles: Vec<_> = (0..8)
        .map(|thread_id| {
            let exiftool = Arc::clone(&exiftool);
            let src = src.clone();
            thread::spawn(move || {
                for call in 0..5 {
                    let marker = format!("<<t{thread_id}c{call}>>");
                    match exiftool
                        .set_tag(&src, None, "Artist", marker.as_str())
                        .unwrap_err()
                    {
                        Error::ResultDecode { output, .. } => {
                            assert!(output.contains(&marker), "{output}");
                            assert_eq!(output.matches("<<t").count(), 1, "{output}");
                        }
                        other => panic!("unexpected error: {other:?}"),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(fs::read(&src).unwrap(), b"original");
    assert!(scratch_entries(&exiftool).is_empty());
}

#[test]
fn programs_follow_configured_scratch_mount() {
    let temp_dir = TempDir::new().unwrap();
    let src = source_file(temp_dir.path(), b"original");
    let config = EngineConfig {
        scratch_mount: "/work".to_string(),
        ..EngineConfig::default()
    };

    let echo = ExifTool::from_module_bytes(&StubGuest::echo().module_bytes(), &config).unwrap();
    match echo.read_metadata(&src).unwrap_err() {
        Error::ResultDecode { output, .. } => {
            assert!(output.contains("ImageInfo('/work/input')"), "{output}");
            assert!(!output.contains("/tmp/"), "{output}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    match echo.set_tag(&src, None, "Artist", "x").unwrap_err() {
        Error::ResultDecode { output, .. } => {
            assert!(output.contains("WriteInfo('/work/input', '/work/output')"), "{output}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let writer = ExifTool::from_module_bytes(
        &StubGuest::responding("1").copying_input().module_bytes(),
        &config,
    )
    .unwrap();
    let dst = temp_dir.path().join("tagged.jpg");
    writer.set_tag(&src, Some(dst.as_path()), "Artist", "x").unwrap();
    let mut expected = b"original".to_vec();
    expected.extend_from_slice(OUTPUT_SUFFIX);
    assert_eq!(fs::read(&dst).unwrap(), expected);
}

#[test]
fn session_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ExifTool>();
}

#[test]
fn invalid_module_fails_construction() {
    let err = ExifTool::from_module_bytes(b"not wasm", &EngineConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::Engine(exif_wasm_engine::Error::Load(_))
    ));
}
