use async_trait::async_trait;
use filetime::FileTime;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use treesync_lib::storage::LocalStorage;
use treesync_lib::{FileEntry, Ownership, Storage, SyncEngine, SyncOptions, SyncStatus};

fn write(path: &Path, len: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, vec![b'x'; len]).unwrap();
}

fn relative_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

async fn sync_local(options: SyncOptions) -> treesync_lib::SyncReport {
    let storage = Arc::new(LocalStorage::new(&options.destination));
    SyncEngine::new(options, storage).run().await.unwrap()
}

#[tokio::test]
async fn test_recursive_tree_sync_is_idempotent() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 10);
    write(&src.path().join("sub/b.txt"), 20);

    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy()).recursive(true);

    let first = sync_local(options.clone()).await;
    assert_eq!(first.status, SyncStatus::Completed);
    assert_eq!(first.files_copied, 2);
    assert_eq!(first.bytes_transferred, 30);
    assert_eq!(relative_files(dst.path()), vec!["a.txt", "sub/b.txt"]);

    let second = sync_local(options).await;
    assert_eq!(second.files_copied, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.bytes_transferred, 0);
}

#[tokio::test]
async fn test_changed_file_is_recopied() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let file = src.path().join("a.txt");
    write(&file, 10);

    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy());
    sync_local(options.clone()).await;

    fs::write(&file, b"a longer body").unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

    let report = sync_local(options).await;
    assert_eq!(report.files_copied, 1);
    assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"a longer body");
}

#[tokio::test]
async fn test_non_recursive_only_copies_top_level_files() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 10);
    write(&src.path().join("sub/b.txt"), 20);

    let report = sync_local(SyncOptions::new(src.path(), dst.path().to_string_lossy())).await;
    assert_eq!(report.files_copied, 1);
    assert_eq!(relative_files(dst.path()), vec!["a.txt"]);
    assert!(!dst.path().join("sub").exists());
}

#[tokio::test]
async fn test_hidden_entries_skipped_unless_enabled() {
    let src = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 1);
    write(&src.path().join(".env"), 1);
    write(&src.path().join(".git/config"), 1);
    write(&src.path().join("sub/.cache"), 1);

    let dst = tempfile::tempdir().unwrap();
    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy()).recursive(true);
    sync_local(options).await;
    assert_eq!(relative_files(dst.path()), vec!["a.txt"]);
    assert!(!dst.path().join(".git").exists());

    let dst = tempfile::tempdir().unwrap();
    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy())
        .recursive(true)
        .hidden(true);
    sync_local(options).await;
    assert_eq!(
        relative_files(dst.path()),
        vec![".env", ".git/config", "a.txt", "sub/.cache"]
    );
}

#[tokio::test]
async fn test_missing_destination_file_is_always_copied() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 5);

    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy());
    sync_local(options.clone()).await;
    fs::remove_file(dst.path().join("a.txt")).unwrap();

    let report = sync_local(options).await;
    assert_eq!(report.files_copied, 1);
    assert!(dst.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_destination_root_created_on_demand() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 3);
    let target = dst.path().join("nested/backup");

    let report = sync_local(SyncOptions::new(src.path(), target.to_string_lossy())).await;
    assert!(report.is_success());
    assert!(target.join("a.txt").exists());
}

#[tokio::test]
async fn test_parallel_jobs_copy_every_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    for i in 0..16 {
        write(&src.path().join(format!("f{:02}.bin", i)), 100 + i);
    }
    write(&src.path().join("sub/deep.bin"), 7);

    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy())
        .recursive(true)
        .jobs(4);
    let report = sync_local(options).await;
    assert_eq!(report.files_copied, 17);
    assert_eq!(relative_files(dst.path()).len(), 17);
}

#[cfg(unix)]
#[tokio::test]
async fn test_metadata_preserved_on_copy() {
    use std::os::unix::fs::PermissionsExt;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let file = src.path().join("sub/b.txt");
    write(&file, 20);
    fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_650_000_000, 0)).unwrap();
    filetime::set_file_mtime(src.path().join("sub"), FileTime::from_unix_time(1_640_000_000, 0))
        .unwrap();

    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy()).recursive(true);
    let report = sync_local(options).await;
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let meta = fs::metadata(dst.path().join("sub/b.txt")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o644);
    let mtime = FileTime::from_last_modification_time(&meta).unix_seconds();
    assert!((mtime - 1_650_000_000).abs() <= 1);

    // 目录修改时间在内容写入后设置
    let dir_meta = fs::metadata(dst.path().join("sub")).unwrap();
    let dir_mtime = FileTime::from_last_modification_time(&dir_meta).unix_seconds();
    assert!((dir_mtime - 1_640_000_000).abs() <= 1);
}

/// 本地存储的包装，按路径注入失败
struct FlakyStorage {
    inner: LocalStorage,
    fail_copy: &'static str,
    fail_chmod: bool,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn ensure_dir(&self, path: &str) -> anyhow::Result<()> {
        self.inner.ensure_dir(path).await
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<FileEntry>> {
        self.inner.stat(path).await
    }

    async fn create_and_copy_into(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> anyhow::Result<u64> {
        if path.ends_with(self.fail_copy) {
            anyhow::bail!("模拟写入失败");
        }
        self.inner.create_and_copy_into(path, reader).await
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> anyhow::Result<()> {
        if self.fail_chmod {
            anyhow::bail!("模拟 chmod 失败");
        }
        self.inner.set_permissions(path, mode).await
    }

    async fn set_modified(&self, path: &str, source: &FileEntry) -> anyhow::Result<()> {
        self.inner.set_modified(path, source).await
    }

    async fn set_owner(&self, path: &str, owner: Ownership) -> anyhow::Result<()> {
        self.inner.set_owner(path, owner).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test]
async fn test_transfer_failure_is_reported_and_sync_continues() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 10);
    write(&src.path().join("bad.txt"), 10);
    write(&src.path().join("sub/b.txt"), 20);

    let storage = Arc::new(FlakyStorage {
        inner: LocalStorage::new(dst.path()),
        fail_copy: "bad.txt",
        fail_chmod: false,
    });
    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy()).recursive(true);
    let report = SyncEngine::new(options, storage).run().await.unwrap();

    assert_eq!(report.status, SyncStatus::Failed);
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.files_copied, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("bad.txt"));
    assert_eq!(relative_files(dst.path()), vec!["a.txt", "sub/b.txt"]);
}

#[tokio::test]
async fn test_metadata_failure_is_only_a_warning() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 10);

    let storage = Arc::new(FlakyStorage {
        inner: LocalStorage::new(dst.path()),
        fail_copy: "never-matches",
        fail_chmod: true,
    });
    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy());
    let report = SyncEngine::new(options, storage).run().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.files_copied, 1);
    assert!(!report.warnings.is_empty());
    assert!(dst.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_missing_source_aborts_before_any_io() {
    let dst = tempfile::tempdir().unwrap();
    let target = dst.path().join("out");
    let options = SyncOptions::new(dst.path().join("missing"), target.to_string_lossy());

    let err = treesync_lib::core::run_sync(options, None).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(!target.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_read_only_file_can_be_updated_on_resync() {
    use std::os::unix::fs::PermissionsExt;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let file = src.path().join("ro.txt");
    fs::write(&file, b"v1").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o444)).unwrap();

    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy());
    let first = sync_local(options.clone()).await;
    assert!(first.is_success());
    let copied = dst.path().join("ro.txt");
    assert_eq!(fs::metadata(&copied).unwrap().permissions().mode() & 0o777, 0o444);

    fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
    fs::write(&file, b"version two").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o444)).unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

    let second = sync_local(options).await;
    assert!(second.is_success(), "{:?}", second.errors);
    assert_eq!(second.files_copied, 1);
    assert_eq!(fs::read(&copied).unwrap(), b"version two");
    assert_eq!(fs::metadata(&copied).unwrap().permissions().mode() & 0o777, 0o444);
    assert_eq!(relative_files(dst.path()), vec!["ro.txt"]);
}

/// 声明支持所有者的本地存储，只记录 chown 调用
struct OwnerRecordingStorage {
    inner: LocalStorage,
    owners: std::sync::Mutex<Vec<(String, Ownership)>>,
}

#[async_trait]
impl Storage for OwnerRecordingStorage {
    async fn ensure_dir(&self, path: &str) -> anyhow::Result<()> {
        self.inner.ensure_dir(path).await
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<FileEntry>> {
        self.inner.stat(path).await
    }

    async fn create_and_copy_into(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> anyhow::Result<u64> {
        self.inner.create_and_copy_into(path, reader).await
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> anyhow::Result<()> {
        self.inner.set_permissions(path, mode).await
    }

    async fn set_modified(&self, path: &str, source: &FileEntry) -> anyhow::Result<()> {
        self.inner.set_modified(path, source).await
    }

    async fn set_owner(&self, path: &str, owner: Ownership) -> anyhow::Result<()> {
        self.owners.lock().unwrap().push((path.to_string(), owner));
        Ok(())
    }

    fn supports_ownership(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "owner-recording"
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_source_owner_applied_when_backend_supports_ownership() {
    use std::os::unix::fs::MetadataExt;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("sub/b.txt"), 20);
    let meta = fs::metadata(src.path().join("sub/b.txt")).unwrap();
    let expected = Ownership {
        uid: meta.uid(),
        gid: meta.gid(),
    };

    let storage = Arc::new(OwnerRecordingStorage {
        inner: LocalStorage::new(dst.path()),
        owners: std::sync::Mutex::new(Vec::new()),
    });
    let options = SyncOptions::new(src.path(), dst.path().to_string_lossy()).recursive(true);
    let report = SyncEngine::new(options, storage.clone()).run().await.unwrap();
    assert!(report.is_success());

    let owners = storage.owners.lock().unwrap();
    assert!(owners.contains(&("sub/b.txt".to_string(), expected)));
    // 根目录与 sub 目录也会同步所有者
    assert!(owners.iter().any(|(path, _)| path == "sub"));
    assert!(owners.iter().any(|(path, _)| path.is_empty()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_backend_never_changes_owner() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(&src.path().join("a.txt"), 4);

    let report = sync_local(SyncOptions::new(src.path(), dst.path().to_string_lossy())).await;
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}
