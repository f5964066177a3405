#[cfg(test)]
mod tests {
    use crate::{Drive, DriveConfig, DriveError, DirectoryId};
    use chunk_store::{MemChunkStore, StructuredVersions};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn test_config() -> DriveConfig {
        DriveConfig {
            file_inactivity_delay_ms: 150,
            directory_inactivity_delay_ms: 300,
            max_versions: 100,
            timer_worker_threads: 2,
        }
    }

    struct Fixture {
        store: Arc<MemChunkStore>,
        versions: Arc<StructuredVersions>,
        root_id: DirectoryId,
        _tmp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let versions = Arc::new(
                StructuredVersions::open(&tmp.path().join("versions.db"), 100).unwrap(),
            );
            Self {
                store: Arc::new(MemChunkStore::new()),
                versions,
                root_id: DirectoryId::random(),
                _tmp: tmp,
            }
        }

        async fn drive(&self, create: bool) -> Drive {
            Drive::new(
                self.store.clone(),
                self.versions.clone(),
                self.root_id.clone(),
                create,
                test_config(),
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/a.txt");

        drive.create(path, false).await.unwrap();
        drive.write(path, b"some file content", 0).await.unwrap();

        let mut buf = [0u8; 17];
        assert_eq!(drive.read(path, &mut buf, 0).await.unwrap(), 17);
        assert_eq!(&buf, b"some file content");
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_boundaries() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/b.txt");
        drive.create(path, false).await.unwrap();
        drive.write(path, b"0123456789", 0).await.unwrap();

        let mut buf = [0u8; 16];
        // straddling the end yields exactly size - offset
        assert_eq!(drive.read(path, &mut buf, 4).await.unwrap(), 6);
        assert_eq!(&buf[..6], b"456789");
        // at or past the end yields nothing
        assert_eq!(drive.read(path, &mut buf, 10).await.unwrap(), 0);
        assert_eq!(drive.read(path, &mut buf, 20).await.unwrap(), 0);
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_grows_recorded_size() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/c.bin");
        drive.create(path, false).await.unwrap();

        drive.write(path, &[1u8; 50], 100).await.unwrap();
        assert_eq!(drive.get_context(path).await.unwrap().size, 150);
        // a write inside the current extent does not shrink it
        drive.write(path, &[2u8; 10], 0).await.unwrap();
        assert_eq!(drive.get_context(path).await.unwrap().size, 150);
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_rapid_close_reopen_preserves_encryptor() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/a.txt");

        drive.create(path, false).await.unwrap();
        drive.write(path, b"hello", 0).await.unwrap();
        drive.release(path).await.unwrap();

        // reopen well inside the inactivity window
        sleep(Duration::from_millis(30)).await;
        drive.open(path).await.unwrap();

        // past the original teardown deadline the same session still
        // serves the bytes without a single chunk fetch
        sleep(Duration::from_millis(200)).await;
        let mut buf = [0u8; 5];
        assert_eq!(drive.read(path, &mut buf, 0).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(fixture.store.get_count(), 0);
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_on_idle_flushes_and_reconstructs() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/b.bin");
        let payload = vec![9u8; 4096];

        drive.create(path, false).await.unwrap();
        drive.write(path, &payload, 0).await.unwrap();
        drive.release(path).await.unwrap();
        assert_eq!(fixture.store.put_count(), 0);

        // let the inactivity teardown fire; the buffered chunk reaches
        // the store exactly once
        sleep(Duration::from_millis(220)).await;
        assert_eq!(fixture.store.put_count(), 1);
        assert_eq!(fixture.store.get_count(), 0);

        // the next open builds a fresh session that has to fetch
        drive.open(path).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        assert_eq!(drive.read(path, &mut buf, 0).await.unwrap(), payload.len());
        assert_eq!(buf, payload);
        assert!(fixture.store.get_count() >= 1);
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_release_balance() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/d.txt");
        drive.create(path, false).await.unwrap();
        drive.open(path).await.unwrap();
        drive.open(path).await.unwrap();
        assert_eq!(drive.get_context(path).await.unwrap().name, "d.txt");

        for _ in 0..3 {
            drive.release(path).await.unwrap();
        }
        // closed again: the teardown is pending, nothing else changed
        assert_eq!(drive.get_context(path).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/e.txt");
        drive.create(path, false).await.unwrap();
        drive.write(path, b"flush me", 0).await.unwrap();

        drive.flush(path).await.unwrap();
        let puts = fixture.store.put_count();
        assert!(puts >= 1);
        drive.flush(path).await.unwrap();
        assert_eq!(fixture.store.put_count(), puts);
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_keeps_live_session() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;

        drive.create(Path::new("/x.txt"), false).await.unwrap();
        drive.write(Path::new("/x.txt"), b"abc", 0).await.unwrap();
        drive.release(Path::new("/x.txt")).await.unwrap();

        drive
            .rename(Path::new("/x.txt"), Path::new("/y.txt"))
            .await
            .unwrap();
        assert!(matches!(
            drive.get_context(Path::new("/x.txt")).await,
            Err(DriveError::NoSuchFile(_))
        ));

        drive.create(Path::new("/sub"), true).await.unwrap();
        drive
            .rename(Path::new("/y.txt"), Path::new("/sub/z.txt"))
            .await
            .unwrap();

        // the moved context kept its buffered session; reopening defuses
        // the teardown re-armed under the new parent
        drive.open(Path::new("/sub/z.txt")).await.unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            drive
                .read(Path::new("/sub/z.txt"), &mut buf, 0)
                .await
                .unwrap(),
            3
        );
        assert_eq!(&buf, b"abc");
        assert_eq!(fixture.store.get_count(), 0);
        drive.release(Path::new("/sub/z.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        drive.create(Path::new("/dir"), true).await.unwrap();
        drive.create(Path::new("/dir/f.txt"), false).await.unwrap();
        drive.release(Path::new("/dir/f.txt")).await.unwrap();

        drive.delete(Path::new("/dir/f.txt")).await.unwrap();
        assert!(matches!(
            drive.get_context(Path::new("/dir/f.txt")).await,
            Err(DriveError::NoSuchFile(_))
        ));
        drive.delete(Path::new("/dir")).await.unwrap();
        assert!(matches!(
            drive.get_context(Path::new("/dir")).await,
            Err(DriveError::NoSuchFile(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_open_dirty_file_flushes_before_returning() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        let path = Path::new("/dirty.bin");
        drive.create(path, false).await.unwrap();
        drive.write(path, &[5u8; 1024], 0).await.unwrap();
        assert_eq!(fixture.store.put_count(), 0);

        // never released, never flushed: the removed context's destructor
        // drains the buffered chunk synchronously before delete returns
        drive.delete(path).await.unwrap();
        assert!(fixture.store.put_count() >= 1);
        assert!(matches!(
            drive.get_context(path).await,
            Err(DriveError::NoSuchFile(_))
        ));

        // the parent directory is healthy afterwards
        drive.create(path, false).await.unwrap();
        drive.write(path, b"fresh", 0).await.unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(drive.read(path, &mut buf, 0).await.unwrap(), 5);
        assert_eq!(&buf, b"fresh");
        drive.release(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_collision() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        drive.create(Path::new("/dup"), false).await.unwrap();
        drive.release(Path::new("/dup")).await.unwrap();
        assert!(matches!(
            drive.create(Path::new("/dup"), false).await,
            Err(DriveError::FileExists(_))
        ));
    }

    #[tokio::test]
    async fn test_release_dir_rewinds_enumeration() {
        let fixture = Fixture::new();
        let drive = fixture.drive(true).await;
        for name in ["/n1", "/n2"] {
            drive.create(Path::new(name), false).await.unwrap();
            drive.release(Path::new(name)).await.unwrap();
        }
        let root = drive.handler().get(Path::new("/")).await.unwrap();
        assert_eq!(
            root.get_child_and_increment_counter().await.unwrap().name,
            "n1"
        );
        assert_eq!(
            root.get_child_and_increment_counter().await.unwrap().name,
            "n2"
        );
        assert!(root.get_child_and_increment_counter().await.is_none());

        drive.release_dir(Path::new("/")).await.unwrap();
        assert_eq!(
            root.get_child_and_increment_counter().await.unwrap().name,
            "n1"
        );
    }

    #[tokio::test]
    async fn test_drop_persists_everything_for_remount() {
        let fixture = Fixture::new();
        let payload = b"survives the remount".to_vec();
        {
            let drive = fixture.drive(true).await;
            drive.create(Path::new("/docs"), true).await.unwrap();
            drive.create(Path::new("/docs/f.txt"), false).await.unwrap();
            drive
                .write(Path::new("/docs/f.txt"), &payload, 0)
                .await
                .unwrap();
            drive.release(Path::new("/docs/f.txt")).await.unwrap();
            // dropping the drive forces every pending store through
        }

        let drive = fixture.drive(false).await;
        let meta = drive.get_context(Path::new("/docs/f.txt")).await.unwrap();
        assert_eq!(meta.size, payload.len() as u64);
        drive.open(Path::new("/docs/f.txt")).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        assert_eq!(
            drive
                .read(Path::new("/docs/f.txt"), &mut buf, 0)
                .await
                .unwrap(),
            payload.len()
        );
        assert_eq!(buf, payload);
        drive.release(Path::new("/docs/f.txt")).await.unwrap();
    }
}
