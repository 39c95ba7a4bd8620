//! End-to-end behaviour of the filesystem over the in-memory backend.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;

use ossfs::{
    AsyncFileSystem, BlockingFileSystem, ErrorKind, FileSystem, FindOptions, FsConfig, OpenMode, OpenOptions,
    OssFileSystem, UploadStrategy,
};
use ossfs_backend::{MemoryBackend, ObjectBackend, Operation};
use ossfs_common::backend::BackendError;
use ossfs_common::path;

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

fn payload(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

fn filesystem(backend: MemoryBackend, config: FsConfig) -> (OssFileSystem, Arc<MemoryBackend>) {
    let backend = Arc::new(backend.with_bucket("data"));
    let fs = OssFileSystem::with_backend(config, backend.clone()).unwrap();
    (fs, backend)
}

async fn write_file(fs: &OssFileSystem, target: &str, opts: OpenOptions, data: &[u8]) {
    let mut file = fs.open_with(target, opts).await.unwrap();
    for chunk in data.chunks(256 * KB) {
        file.write(chunk).await.unwrap();
    }
    file.close().await.unwrap();
}

#[tokio::test]
async fn round_trip_across_chunking_threshold() {
    for strategy in [UploadStrategy::Append, UploadStrategy::Multipart] {
        let config = FsConfig {
            upload_strategy: strategy,
            ..Default::default()
        };
        let (fs, _) = filesystem(MemoryBackend::new(), config);
        for (idx, len) in [0, KB, MB, 10 * MB].into_iter().enumerate() {
            let data = payload(len, idx as u8);
            let target = format!("/data/roundtrip/{:?}-{}", strategy, len);
            write_file(&fs, &target, OpenOptions::new(OpenMode::Write), &data).await;

            assert_eq!(AsyncFileSystem::size(&fs, &target).await.unwrap(), len as u64);
            let mut file = fs.open(&target, "rb").await.unwrap();
            assert_eq!(file.read(None).await.unwrap(), data);
            file.close().await.unwrap();

            let mid = len / 3;
            let end = (mid + 1000).min(len);
            let slice = fs.cat_file(&target, Some(mid as u64..end as u64)).await.unwrap();
            assert_eq!(slice, data.slice(mid..end));
        }
    }
}

#[tokio::test]
async fn pipe_round_trip_uses_multipart_above_limit() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    let small = payload(MB, 1);
    let large = payload(10 * MB, 2);
    fs.pipe("/data/pipe/small", small.clone()).await.unwrap();
    fs.pipe("/data/pipe/large", large.clone()).await.unwrap();
    assert_eq!(backend.calls(Operation::PutObject), 1);
    assert_eq!(backend.calls(Operation::UploadPart), 2);
    assert_eq!(fs.cat("/data/pipe/small").await.unwrap(), small);
    assert_eq!(fs.cat("/data/pipe/large").await.unwrap(), large);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_then_listing() {
    let (fs, _) = filesystem(MemoryBackend::new().with_page_size(250), FsConfig::default());
    let mut tasks = JoinSet::new();
    for i in 0..1200 {
        let fs = fs.clone();
        tasks.spawn(async move {
            fs.pipe(&format!("/data/many/obj{:04}", i), Bytes::from(i.to_string()))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let listed = fs.ls("/data/many").await.unwrap();
    assert_eq!(listed.len(), 1200);
    assert!(listed.windows(2).all(|w| w[0].name < w[1].name));

    let opts = FindOptions {
        prefix: Some("obj".into()),
        ..Default::default()
    };
    assert_eq!(fs.find("/data/many", &opts).await.unwrap().len(), 1200);
}

/// The four ways an append can meet its target: written through a handle
/// (appendable) or as a whole put (not appendable), on a backend with or
/// without the append capability.
#[tokio::test]
async fn append_combinations() {
    let block = KB;
    let sizes = [0, 100, 3 * KB];
    for append_capable in [true, false] {
        for through_handle in [true, false] {
            let backend = if append_capable {
                MemoryBackend::new()
            } else {
                MemoryBackend::new().without_append()
            };
            let (fs, _) = filesystem(backend, FsConfig::default());
            for (i, &first) in sizes.iter().enumerate() {
                for (j, &second) in sizes.iter().enumerate() {
                    let target = format!("/data/append/{}-{}", i, j);
                    let data = payload(first, 7);
                    let extra = payload(second, 91);
                    if through_handle {
                        write_file(&fs, &target, OpenOptions::new(OpenMode::Write).block_size(block), &data).await;
                    } else {
                        fs.pipe(&target, data.clone()).await.unwrap();
                    }
                    write_file(&fs, &target, OpenOptions::new(OpenMode::Append).block_size(block), &extra).await;

                    let mut expected = data.to_vec();
                    expected.extend_from_slice(&extra);
                    assert_eq!(
                        fs.cat(&target).await.unwrap().to_vec(),
                        expected,
                        "append_capable={} through_handle={} first={} second={}",
                        append_capable,
                        through_handle,
                        first,
                        second
                    );
                }
            }
        }
    }
}

#[tokio::test]
async fn append_creates_missing_object() {
    let (fs, _) = filesystem(MemoryBackend::new(), FsConfig::default());
    write_file(&fs, "/data/fresh.log", OpenOptions::new(OpenMode::Append), b"entry").await;
    assert_eq!(fs.cat("/data/fresh.log").await.unwrap(), Bytes::from_static(b"entry"));
}

#[tokio::test]
async fn recursive_delete_splits_into_batches() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    for i in 0..1500 {
        backend
            .put_object("data", &format!("bulk/{:05}", i), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    fs.rm(&["/data/bulk"], true, None).await.unwrap();
    assert!(backend.calls(Operation::DeleteObjects) >= 2);
    assert_eq!(backend.object_count("data"), 0);
    assert!(!fs.exists("/data/bulk").await.unwrap());
}

#[tokio::test]
async fn bulk_delete_rejects_oversized_request() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    let paths: Vec<String> = (0..1001).map(|i| format!("/data/k{}", i)).collect();
    let err = fs.bulk_delete(&paths).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(backend.calls(Operation::DeleteObjects), 0);
}

#[tokio::test]
async fn cross_container_copy_leaves_no_residue() {
    let staging = tempfile::tempdir().unwrap();
    let config = FsConfig {
        staging_dir: Some(staging.path().to_path_buf()),
        ..Default::default()
    };
    let (fs, backend) = filesystem(MemoryBackend::new().with_bucket("archive"), config);
    let data = payload(2 * MB, 3);
    fs.pipe("/data/report.bin", data.clone()).await.unwrap();

    fs.cp_file("/data/report.bin", "/archive/report.bin").await.unwrap();
    assert_eq!(fs.cat("/archive/report.bin").await.unwrap(), data);
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);

    backend.fail_next(Operation::PutObject, 1, BackendError::service(403, "AccessDenied", "read-only"));
    let err = fs.cp_file("/data/report.bin", "/archive/denied.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    assert!(!fs.exists("/archive/denied.bin").await.unwrap());
}

#[tokio::test]
async fn prefix_boundaries_are_respected() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    for key in ["prefix1", "prefix2", "prefix3/something"] {
        backend.put_object("data", key, Bytes::from_static(b"v")).await.unwrap();
    }
    assert!(!fs.exists("/data/prefix").await.unwrap());
    assert!(fs.exists("/data/prefix3").await.unwrap());
    assert!(fs.exists("/data/prefix3/something").await.unwrap());
    assert!(fs.exists("/data/prefix1").await.unwrap());
    assert!(!fs.exists("/data/prefix1/x").await.unwrap());
    assert!(fs.info("/data/prefix").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn removal_invalidates_cached_listing() {
    let (fs, _) = filesystem(MemoryBackend::new(), FsConfig::default());
    fs.pipe("/data/dir/keep", Bytes::from_static(b"1")).await.unwrap();
    fs.pipe("/data/dir/drop", Bytes::from_static(b"2")).await.unwrap();
    assert_eq!(fs.ls("/data/dir").await.unwrap().len(), 2);
    assert!(fs.dircache().contains("/data/dir"));

    fs.rm(&["/data/dir/drop"], false, None).await.unwrap();
    assert!(!fs.dircache().contains("/data/dir"));
    assert!(!fs.exists("/data/dir/drop").await.unwrap());
    let names = fs.ls_names("/data/dir").await.unwrap();
    assert_eq!(names, vec!["/data/dir/keep"]);
}

#[tokio::test]
async fn listing_is_sorted_with_directory_sizes_zeroed() {
    let (fs, _) = filesystem(MemoryBackend::new(), FsConfig::default());
    fs.pipe("/data/sorted/b", Bytes::from_static(b"bb")).await.unwrap();
    fs.pipe("/data/sorted/a", Bytes::from_static(b"a")).await.unwrap();
    fs.pipe("/data/sorted/c/inner", Bytes::from_static(b"ccc")).await.unwrap();
    let entries = fs.ls("/data/sorted").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["/data/sorted/a", "/data/sorted/b", "/data/sorted/c"]);
    assert_eq!(entries[0].size, 1);
    assert_eq!(entries[1].size, 2);
    assert!(entries[2].is_dir());
    assert_eq!(entries[2].size, 0);
}

#[tokio::test]
async fn missing_paths_report_not_found() {
    let (fs, _) = filesystem(MemoryBackend::new(), FsConfig::default());
    assert!(!fs.exists("/data/nothing/here").await.unwrap());
    assert_eq!(fs.info("/data/nothing/here").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(fs.info("").await.unwrap().is_dir());
    assert!(fs.info("/").await.unwrap().is_dir());
}

#[test]
fn normalization_is_idempotent() {
    let samples = [
        "",
        "/",
        "data",
        "/data/",
        "data/a/b",
        "//data//a/",
        "oss://data/a/b",
        "https://oss-cn-hangzhou.aliyuncs.com/data/a/b",
        "/data/a//b",
    ];
    for sample in samples {
        let once = path::normalize(sample);
        assert_eq!(path::resolve(&once), path::resolve(sample), "{}", sample);
        assert_eq!(path::normalize(&once), once);
    }
}

#[tokio::test]
async fn transient_failures_are_retried_then_surface() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    fs.pipe("/data/flaky", Bytes::from_static(b"ok")).await.unwrap();

    backend.fail_next(Operation::GetObject, 2, BackendError::Request("connection reset".into()));
    assert_eq!(fs.cat("/data/flaky").await.unwrap(), Bytes::from_static(b"ok"));

    backend.fail_next(Operation::GetObject, 3, BackendError::service(503, "SlowDown", "busy"));
    let err = fs.cat("/data/flaky").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GenericIo);
    assert_eq!(err.backend_source().and_then(|e| e.code()), Some("SlowDown"));
}

#[tokio::test]
async fn anonymous_root_listing_is_empty() {
    let backend = Arc::new(MemoryBackend::new().with_bucket("public").anonymous());
    let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
    assert!(fs.ls("/").await.unwrap().is_empty());
    assert!(fs.exists("/public").await.unwrap());
}

#[test]
fn blocking_mode_from_many_threads() {
    let backend = Arc::new(MemoryBackend::new().with_bucket("data"));
    let fs = BlockingFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let fs = fs.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    let target = format!("/data/threads/{}-{}", t, i);
                    fs.pipe(&target, Bytes::from(target.clone())).unwrap();
                    assert_eq!(fs.cat(&target).unwrap(), Bytes::from(target));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(fs.ls("/data/threads").unwrap().len(), 40);
    let expected: u64 = fs.ls_names("/data/threads").unwrap().iter().map(|n| n.len() as u64).sum();
    assert_eq!(fs.du("/data/threads").unwrap(), expected);
}

#[test]
fn blocking_get_and_put_files() {
    let backend = Arc::new(MemoryBackend::new().with_bucket("data"));
    let config = FsConfig {
        default_block_size: 64 * KB,
        multipart_threshold: 256 * KB as u64,
        ..Default::default()
    };
    let fs = BlockingFileSystem::with_backend(config, backend.clone()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let local = dir.path().join("upload.bin");
    let data = payload(MB, 5);
    std::fs::write(&local, &data).unwrap();
    fs.put_file(&local, "/data/files/upload.bin").unwrap();
    assert!(backend.calls(Operation::UploadPart) >= 16);

    let back = dir.path().join("download.bin");
    fs.get_file("/data/files/upload.bin", &back).unwrap();
    assert_eq!(std::fs::read(&back).unwrap(), data.to_vec());
}

#[tokio::test]
async fn config_file_drives_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("ossfs.toml");
    std::fs::write(
        &config_path,
        r#"
endpoint = "oss-cn-hangzhou.aliyuncs.com"
default_cache_type = "none"
default_block_size = 4096
"#,
    )
    .unwrap();
    let config = FsConfig::load(&config_path).unwrap();
    let backend = Arc::new(MemoryBackend::new().with_bucket("data"));
    let fs = OssFileSystem::with_backend(config, backend.clone()).unwrap();
    fs.pipe("/data/obj", payload(10_000, 9)).await.unwrap();
    assert_eq!(backend.calls(Operation::UploadPart), 3);

    let mut file = fs.open("/data/obj", "r").await.unwrap();
    file.read(Some(10)).await.unwrap();
    file.read(Some(10)).await.unwrap();
    assert_eq!(backend.calls(Operation::GetObject), 2);
}

#[tokio::test]
async fn multipart_write_retries_failed_parts() {
    let config = FsConfig {
        upload_strategy: UploadStrategy::Multipart,
        ..Default::default()
    };
    let (fs, backend) = filesystem(MemoryBackend::new(), config);
    let data = payload(3 * KB + 100, 4);
    backend.fail_next(Operation::UploadPart, 2, BackendError::Request("connection reset".into()));
    backend.fail_next(Operation::CompleteMultipart, 1, BackendError::service(503, "ServiceUnavailable", "busy"));

    write_file(&fs, "/data/parts.bin", OpenOptions::new(OpenMode::Write).block_size(KB), &data).await;

    assert_eq!(fs.cat("/data/parts.bin").await.unwrap(), data);
    assert_eq!(backend.calls(Operation::UploadPart), 4 + 2);
    assert_eq!(backend.calls(Operation::CompleteMultipart), 2);
    assert_eq!(backend.pending_uploads(), 0);
}

#[tokio::test]
async fn pipe_retries_failed_parts() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    let data = payload(10 * MB, 6);
    backend.fail_next(Operation::UploadPart, 1, BackendError::service(503, "SlowDown", "reduce rate"));
    fs.pipe("/data/piped.bin", data.clone()).await.unwrap();
    assert_eq!(fs.cat("/data/piped.bin").await.unwrap(), data);
    assert_eq!(backend.calls(Operation::UploadPart), 3);
    assert_eq!(backend.pending_uploads(), 0);
}

#[tokio::test]
async fn recursive_delete_retries_a_failed_batch() {
    let (fs, backend) = filesystem(MemoryBackend::new(), FsConfig::default());
    for i in 0..1500 {
        backend
            .put_object("data", &format!("bulk/{:05}", i), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    backend.put_object("data", "keep/me", Bytes::from_static(b"k")).await.unwrap();
    backend.fail_next(Operation::DeleteObjects, 1, BackendError::service(503, "SlowDown", "reduce rate"));

    fs.rm(&["/data/bulk"], true, None).await.unwrap();

    assert!(backend.calls(Operation::DeleteObjects) >= 3);
    assert_eq!(backend.object_count("data"), 1);
    assert_eq!(backend.object("data", "keep/me"), Some(Bytes::from_static(b"k")));
    assert!(!fs.exists("/data/bulk").await.unwrap());
}

#[test]
fn blocking_file_outlives_its_filesystem() {
    let backend = Arc::new(MemoryBackend::new().with_bucket("data"));
    let fs = BlockingFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
    let mut closed_explicitly = fs.open("/data/explicit.txt", "wb").unwrap();
    let mut closed_on_drop = fs.open("/data/dropped.txt", "wb").unwrap();
    drop(fs);

    closed_explicitly.write_all(b"hello").unwrap();
    backend.fail_next(Operation::AppendObject, 1, BackendError::Request("connection reset".into()));
    closed_explicitly.close().unwrap();
    assert_eq!(backend.object("data", "explicit.txt"), Some(Bytes::from_static(b"hello")));

    closed_on_drop.write_all(b"bye").unwrap();
    drop(closed_on_drop);
    assert_eq!(backend.object("data", "dropped.txt"), Some(Bytes::from_static(b"bye")));
}
