/// End-to-end tests for the wrapper, each on its own event-loop instance.
#[cfg(test)]
mod tests {
    use std::io::SeekFrom;
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use crate::error::file::FileError;
    use crate::event_loop::IoLoop;
    use crate::vfile::{DownloadCallback, VFile};

    fn scratch_file(content: &[u8]) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path.to_str().unwrap().to_owned())
    }

    /// Polls `cond` until it holds, with a hard deadline.
    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn seeks_clamp_for_every_mode() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(b"0123456789");
        let f = VFile::create(&io, path);
        assert!(!f.failed());
        assert_eq!(f.size(), 10);

        assert_eq!(f.rseek(SeekFrom::Start(25)), 10);
        assert!(f.eof());
        assert_eq!(f.rseek(SeekFrom::Start(3)), 3);
        assert_eq!(f.rseek(SeekFrom::Current(-99)), 0);
        assert_eq!(f.rseek(SeekFrom::End(-3)), 7);
        assert_eq!(f.rseek(SeekFrom::End(5)), 10);
        assert_eq!(f.rseek(SeekFrom::End(-99)), 0);

        assert_eq!(f.wseek(SeekFrom::Start(4)), 4);
        // the write cursor may pass end-of-file
        assert_eq!(f.wseek(SeekFrom::End(7)), 17);
        assert_eq!(f.wseek(SeekFrom::Current(-100)), 0);
        assert_eq!(f.wseek(SeekFrom::Current(-1)), 0);

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn read_past_eof_is_no_data_and_keeps_cursor() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(b"0123456789");
        let f = VFile::open(&io, path);

        assert_eq!(f.rseek(SeekFrom::End(0)), 10);
        let mut buf = [0u8; 4];
        assert!(matches!(f.read(&mut buf), Err(FileError::NoData)));
        assert_eq!(f.read_pos(), 10);
        assert!(matches!(f.read_at(&mut buf, 10), Err(FileError::NoData)));
        assert!(matches!(f.read_at(&mut buf, 999), Err(FileError::NoData)));

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn read_at_offset_five_clamps_to_five_bytes() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(b"0123456789");
        let f = VFile::open(&io, path);

        assert_eq!(f.rseek(SeekFrom::Start(5)), 5);
        let mut buf = [0u8; 10];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"56789");
        assert_eq!(f.read_pos(), 10);
        assert!(f.eof());

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn write_then_reopen_reads_back_identical() {
        let io = IoLoop::spawn().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin").to_str().unwrap().to_owned();
        let data = pattern(100);

        let f = VFile::truncate(&io, path.clone());
        assert!(!f.failed());
        assert_eq!(f.write(&data).unwrap(), 100);
        assert_eq!(f.write_pos(), 100);
        // the durable write is fire-and-forget; its completion is observable
        // through the written-bytes counter
        wait_until("write completion", || io.written_total() == 100);
        f.close();

        let f = VFile::read_write(&io, path);
        assert!(!f.failed());
        assert_eq!(f.size(), 100);
        let mut buf = vec![0u8; 100];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 100);
        assert_eq!(buf, data);

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn positioned_write_round_trips_at_same_offset() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(&pattern(64));
        let f = VFile::read_write(&io, path);

        assert_eq!(f.write_at(b"redux", 20).unwrap(), 5);
        assert_eq!(f.write_at(b"redux", 20).unwrap(), 5);
        // positioned writes leave the cursor alone
        assert_eq!(f.write_pos(), 0);
        wait_until("both writes durable", || io.written_total() == 10);

        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&mut buf, 20).unwrap(), 5);
        assert_eq!(&buf, b"redux");

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn failed_open_never_raises_and_rejects_io() {
        let io = IoLoop::spawn().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin").to_str().unwrap().to_owned();

        let f = VFile::open(&io, path.clone());
        assert!(f.failed());
        assert_eq!(f.size(), 0);
        assert_eq!(f.read_pos(), 0);
        let mut buf = [0u8; 4];
        assert!(matches!(f.read(&mut buf), Err(FileError::NoData)));
        // caching a failed handle is a silent no-op
        f.start_caching().unwrap();
        assert_eq!(f.cache_progress(), 0.0);

        let f = VFile::read_write(&io, format!("{path}.rw"));
        assert!(f.failed());
        assert!(matches!(f.write(b"abc"), Err(FileError::Failed)));

        let ro = VFile::open(&io, path);
        assert!(matches!(ro.write(b"abc"), Err(FileError::NotWritable)));

        io.shutdown().unwrap();
    }

    #[test]
    fn cached_reads_match_uncached_reads() {
        let io = IoLoop::spawn().unwrap();
        let data = pattern(200 * 1024);
        let (_dir, path) = scratch_file(&data);
        let f = VFile::open(&io, path);

        let mut uncached = vec![0u8; 1024];
        assert_eq!(f.read_at(&mut uncached, 1000).unwrap(), 1024);

        f.start_caching().unwrap();
        assert!(matches!(
            f.start_caching(),
            Err(FileError::AlreadyCached)
        ));
        wait_until("cache fill", || f.cache_progress() == 1.0);

        let mut cached = vec![0u8; 1024];
        assert_eq!(f.read_at(&mut cached, 1000).unwrap(), 1024);
        assert_eq!(cached, uncached);

        let mut whole = vec![0u8; data.len()];
        assert_eq!(f.read(&mut whole).unwrap(), data.len());
        assert_eq!(whole, data);
        assert!(f.eof());

        // the fill itself went through the read counter
        assert!(io.read_total() >= data.len() as u64);

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn close_blocks_until_cache_progress_is_full() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(&pattern(200 * 1024));
        let f = VFile::open(&io, path);

        f.start_caching().unwrap();
        f.close();
        assert_eq!(f.cache_progress(), 1.0);

        io.shutdown().unwrap();
    }

    #[test]
    fn caching_an_empty_file_completes() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(b"");
        let f = VFile::open(&io, path);
        assert_eq!(f.size(), 0);
        assert!(f.eof());

        f.start_caching().unwrap();
        wait_until("empty cache fill", || f.cache_progress() == 1.0);
        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn writes_extend_the_cache_and_size() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path) = scratch_file(&pattern(1024));
        let f = VFile::read_write(&io, path);

        f.start_caching().unwrap();
        // gated on the fill: by the time this returns the cache is complete
        assert_eq!(f.write_at(b"hello", 2048).unwrap(), 5);
        assert_eq!(f.cache_progress(), 1.0);
        assert_eq!(f.size(), 2053);

        // the extended region is served straight from the cache
        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&mut buf, 2048).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn live_file_registry_tracks_wrappers() {
        let io = IoLoop::spawn().unwrap();
        let (_dir, path_a) = scratch_file(b"aa");
        let (_dir_b, path_b) = scratch_file(b"bb");

        let a = VFile::open(&io, path_a.clone());
        let b = VFile::open(&io, path_b.clone());
        let names = io.live_files().unwrap();
        assert!(names.contains(&path_a));
        assert!(names.contains(&path_b));

        b.close();
        drop(b);
        let names = io.live_files().unwrap();
        assert_eq!(names, vec![path_a]);

        a.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn download_retains_body_and_fires_callback() {
        let io = IoLoop::spawn().unwrap();
        let body = pattern(96 * 1024);
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/data.bin")
            .with_status(200)
            .with_body(&body)
            .create();
        let url = format!("{}/data.bin", server.url());

        let (tx, rx) = std::sync::mpsc::channel();
        let callback: DownloadCallback = Box::new(move |file, effective_url| {
            let _ = tx.send((file, effective_url.to_owned()));
        });
        let f = VFile::download(&io, &url, Some(callback)).unwrap();
        assert!(!f.failed());

        let (done, effective_url) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(effective_url, url);
        assert!(done.download_complete());
        assert_eq!(done.cache_progress(), 1.0);
        assert_eq!(done.size(), body.len() as u64);

        let mut got = vec![0u8; body.len()];
        assert_eq!(f.read(&mut got).unwrap(), body.len());
        assert_eq!(got, body);
        assert!(f.eof());

        mock.assert();
        f.close();
        io.shutdown().unwrap();
    }

    #[test]
    fn download_rejects_unparseable_url() {
        let io = IoLoop::spawn().unwrap();
        assert!(matches!(
            VFile::download(&io, "not a url", None),
            Err(FileError::BadUrl(_))
        ));
        io.shutdown().unwrap();
    }

    #[test]
    fn failed_download_still_fires_callback() {
        let io = IoLoop::spawn().unwrap();
        // nothing listens here; the connect fails quickly
        let url = "http://127.0.0.1:9/unreachable";

        let (tx, rx) = std::sync::mpsc::channel();
        let callback: DownloadCallback = Box::new(move |file, effective_url| {
            let _ = tx.send((file.download_complete(), effective_url.to_owned()));
        });
        let f = VFile::download(&io, url, Some(callback)).unwrap();

        let (completed, effective_url) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(completed);
        assert_eq!(effective_url, url);
        // never got a body; the wrapper stays empty but is not "failed"
        assert!(!f.failed());
        assert_eq!(f.size(), 0);

        io.shutdown().unwrap();
    }
}
