//! 多线程下的追加写与长度一致性

use std::sync::{Arc, Mutex};
use std::thread;

use pond_fs::FileSystem;
use pond_fs_fuse::MemDisk;

const WRITERS: usize = 2;
const ROUNDS: usize = 100;
const CHUNK: usize = 100;

#[test]
fn serialized_appends_reach_exact_length() {
    let fs = FileSystem::format(Arc::new(MemDisk::new(4096)));
    let root = fs.root_dir();
    fs.create(&root, "/shared", 0).unwrap();

    let append_lock = Arc::new(Mutex::new(()));
    let workers: Vec<_> = (0..WRITERS)
        .map(|id| {
            let fs = fs.clone();
            let append_lock = append_lock.clone();
            thread::spawn(move || {
                let cwd = fs.root_dir();
                let file = fs.open_file(&cwd, "/shared").unwrap();
                let payload = [id as u8 + 1; CHUNK];
                for _ in 0..ROUNDS {
                    let _serial = append_lock.lock().unwrap();
                    file.seek(file.length());
                    assert_eq!(file.write(&payload), CHUNK);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let file = fs.open_file(&root, "/shared").unwrap();
    assert_eq!(file.length(), WRITERS * ROUNDS * CHUNK);

    let mut buf = vec![0u8; WRITERS * ROUNDS * CHUNK];
    assert_eq!(file.read(&mut buf), buf.len());
    assert!(buf.iter().all(|&b| b == 1 || b == 2));
}

#[test]
fn racing_appends_keep_length_consistent() {
    let fs = FileSystem::format(Arc::new(MemDisk::new(4096)));
    let root = fs.root_dir();
    fs.create(&root, "/shared", 0).unwrap();

    let workers: Vec<_> = (0..WRITERS)
        .map(|id| {
            let fs = fs.clone();
            thread::spawn(move || {
                let cwd = fs.root_dir();
                let file = fs.open_file(&cwd, "/shared").unwrap();
                let payload = [id as u8 + 1; CHUNK];
                for _ in 0..ROUNDS {
                    // 游标取自过期的长度也无妨，写入只会互相覆盖
                    file.seek(file.length());
                    assert_eq!(file.write(&payload), CHUNK);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let file = fs.open_file(&root, "/shared").unwrap();
    let length = file.length();
    assert!(length >= CHUNK && length <= WRITERS * ROUNDS * CHUNK);
    // 长度总是推进到某次写入的终点
    assert_eq!(length % CHUNK, 0);

    // `[0, length)`内没有任何未初始化的字节：
    // 每一段`CHUNK`都至少被一个写者完整覆盖过
    let mut buf = vec![0u8; length];
    assert_eq!(file.read(&mut buf), length);
    assert!(buf.iter().all(|&b| b == 1 || b == 2));
}

#[test]
fn parallel_files_do_not_interfere() {
    let fs = FileSystem::format(Arc::new(MemDisk::new(8192)));
    let root = fs.root_dir();
    for id in 0..4 {
        fs.create(&root, &format!("/f{id}"), 0).unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|id| {
            let fs = fs.clone();
            thread::spawn(move || {
                let cwd = fs.root_dir();
                let file = fs.open_file(&cwd, &format!("/f{id}")).unwrap();
                let pattern: Vec<u8> = (0..3000).map(|i| ((i + id * 31) % 256) as u8).collect();
                assert_eq!(file.write(&pattern), 3000);

                let mut buf = vec![0u8; 3000];
                file.seek(0);
                assert_eq!(file.read(&mut buf), 3000);
                assert_eq!(buf, pattern);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}
