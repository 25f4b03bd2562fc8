//! 缓冲区缓存的写回、换入与一致性

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use pond_fs::FileSystem;
use pond_fs_fuse::{BlockFile, MemDisk};

#[test]
fn fault_in_reads_device_exactly_once() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = FileSystem::format(disk.clone());
        let root = fs.root_dir();
        fs.create(&root, "/big", 0).unwrap();
        let file = fs.open_file(&root, "/big").unwrap();
        assert_eq!(file.write(&vec![3u8; 100 * 512]), 100 * 512);
        drop(file);
        drop(root);
        fs.done();
    }

    // 重新挂载：缓存全冷
    let fs = FileSystem::open_device(disk.clone());
    let root = fs.root_dir();
    let file = fs.open_file(&root, "/big").unwrap();

    let mut buf = [0u8; 1];
    file.seek(90 * 512);
    let reads_before = disk.reads();
    assert_eq!(file.read(&mut buf), 1);
    // 一次换入头部扇区，一次换入数据扇区
    assert_eq!(disk.reads() - reads_before, 2);
    assert_eq!(buf[0], 3);
    assert!(fs.cache_contains(file.inumber()));

    // 再读同一扇区完全命中，设备不再被打扰
    let reads_resident = disk.reads();
    file.seek(90 * 512);
    assert_eq!(file.read(&mut buf), 1);
    assert_eq!(disk.reads(), reads_resident);
}

#[test]
fn clean_eviction_discards_dirty_eviction_writes_back() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = FileSystem::format(disk.clone());
        let root = fs.root_dir();
        fs.create(&root, "/big", 0).unwrap();
        let file = fs.open_file(&root, "/big").unwrap();
        assert_eq!(file.write(&vec![5u8; 100 * 512]), 100 * 512);
        drop(file);
        drop(root);
        fs.done();
    }

    let fs = FileSystem::open_device(disk.clone());
    let root = fs.root_dir();
    let file = fs.open_file(&root, "/big").unwrap();
    let mut buf = [0u8; 1];

    // 干净的牺牲者直接丢弃：跑满一轮缓存容量的读，设备写为零
    let writes_before = disk.writes();
    for index in 0..70 {
        file.seek(index * 512);
        assert_eq!(file.read(&mut buf), 1);
    }
    assert_eq!(disk.writes(), writes_before);

    // 脏的牺牲者先写回：弄脏的扇区超过槽位数，时钟算法必然淘汰到脏块
    let writes_before = disk.writes();
    for index in 0..70 {
        file.seek(index * 512);
        assert_eq!(file.write(&[7u8]), 1);
    }
    assert!(disk.writes() > writes_before);

    // 写回加收尾冲刷之后，设备上的内容完整
    drop(file);
    drop(root);
    fs.done();

    let fs = FileSystem::open_device(disk);
    let root = fs.root_dir();
    let file = fs.open_file(&root, "/big").unwrap();
    for index in 0..70 {
        file.seek(index * 512);
        assert_eq!(file.read(&mut buf), 1);
        assert_eq!(buf[0], 7);
    }
}

#[test]
fn two_handles_observe_same_bytes_without_flush() {
    let fs = FileSystem::format(Arc::new(MemDisk::new(4096)));
    let root = fs.root_dir();

    fs.create(&root, "/shared", 0).unwrap();
    let writer = fs.open_file(&root, "/shared").unwrap();
    let reader = fs.open_file(&root, "/shared").unwrap();

    let pattern: Vec<u8> = (0..2000).map(|i| (i * 7 % 251) as u8).collect();
    assert_eq!(writer.write(&pattern), 2000);

    // 未经任何冲刷，另一个句柄立即看到同样的字节
    let mut buf = vec![0u8; 2000];
    assert_eq!(reader.read(&mut buf), 2000);
    assert_eq!(buf, pattern);

    // 交错续写同样一致
    assert_eq!(writer.write(&pattern), 2000);
    assert_eq!(reader.read(&mut buf), 2000);
    assert_eq!(buf, pattern);
}

#[test]
fn flush_all_then_remount_exposes_everything() {
    let disk = Arc::new(MemDisk::new(4096));
    let pattern: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();

    {
        let fs = FileSystem::format(disk.clone());
        let root = fs.root_dir();
        fs.create_dir(&root, "/d").unwrap();
        fs.create(&root, "/d/k", 0).unwrap();
        let file = fs.open_file(&root, "/d/k").unwrap();
        assert_eq!(file.write(&pattern), 3000);
        drop(file);
        drop(root);
        fs.done();
    }

    let fs = FileSystem::open_device(disk);
    let root = fs.root_dir();
    let file = fs.open_file(&root, "/d/k").unwrap();
    assert_eq!(file.length(), 3000);
    let mut buf = vec![0u8; 3000];
    assert_eq!(file.read(&mut buf), 3000);
    assert_eq!(buf, pattern);
}

#[test]
fn block_file_image_survives_reopen() {
    let path = std::env::temp_dir().join(format!("pond-fs-test-{}.img", std::process::id()));
    let pattern: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

    {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        fd.set_len(2048 * 512).unwrap();

        let fs = FileSystem::format(Arc::new(BlockFile(Mutex::new(fd))));
        let root = fs.root_dir();
        fs.create(&root, "/persist", 0).unwrap();
        let file = fs.open_file(&root, "/persist").unwrap();
        assert_eq!(file.write(&pattern), 1000);
        drop(file);
        drop(root);
        fs.done();
    }

    {
        let fd = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let fs = FileSystem::open_device(Arc::new(BlockFile(Mutex::new(fd))));
        let root = fs.root_dir();
        let file = fs.open_file(&root, "/persist").unwrap();
        assert_eq!(file.length(), 1000);
        let mut buf = vec![0u8; 1000];
        assert_eq!(file.read(&mut buf), 1000);
        assert_eq!(buf, pattern);
    }

    let _ = std::fs::remove_file(&path);
}
