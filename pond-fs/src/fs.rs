//! # 文件系统门面
//!
//! 挂载、格式化与关停，以及所有以路径为参数的操作。
//!
//! 目录变更路径（创建、打开、删除、建目录）由粗粒度的`op_lock`
//! 串行化，多步的父目录更新不会交错；数据读写则只依赖
//! 各inode自己的扩展锁与缓存槽位锁，可以并发进行。
//!
//! 锁的次序自粗到细：`op_lock` → 扩展锁 → 位图锁 → 缓存槽位锁，
//! 持有细锁时不得反向申请粗锁。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use block_dev::BlockDevice;
use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::dir::Directory;
use crate::file::File;
use crate::free_map::FreeMap;
use crate::layout::DiskInode;
use crate::path;
use crate::vfs::Inode;
use crate::Error;
use crate::ROOT_DIR_SECTOR;

pub struct FileSystem {
    pub(crate) cache: BufferCache,
    pub(crate) free_map: FreeMap,
    /// 打开inode表：每个扇区号至多对应一个内存inode
    pub(crate) inodes: Mutex<BTreeMap<u32, Arc<Inode>>>,
    /// 目录变更的粗粒度串行化锁
    op_lock: Mutex<()>,
}

impl FileSystem {
    /// 格式化设备并挂载：建立空闲位图文件与带`.`/`..`的根目录
    pub fn format(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let sectors = device.sector_count();
        let cache = BufferCache::new(device);
        let free_map = FreeMap::format(&cache, sectors);

        let fs = Arc::new(Self {
            cache,
            free_map,
            inodes: Mutex::new(BTreeMap::new()),
            op_lock: Mutex::new(()),
        });

        Directory::create(&fs, ROOT_DIR_SECTOR, Directory::INITIAL_CAPACITY)
            .expect("root directory creation failed");
        let root = Directory::open_root(&fs);
        root.init_dots(ROOT_DIR_SECTOR)
            .expect("root directory init failed");
        drop(root);

        fs.cache.sync_all();
        log::info!("formatted device: {sectors} sectors");
        fs
    }

    /// 挂载已格式化的设备
    pub fn open_device(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let sectors = device.sector_count();
        let cache = BufferCache::new(device);
        let free_map = FreeMap::open(&cache, sectors);

        cache
            .get(ROOT_DIR_SECTOR)
            .lock()
            .map(0, |disk: &DiskInode| {
                assert!(disk.is_valid() && disk.is_dir(), "bad root directory inode");
            });

        log::info!("mounted device: {sectors} sectors");
        Arc::new(Self {
            cache,
            free_map,
            inodes: Mutex::new(BTreeMap::new()),
            op_lock: Mutex::new(()),
        })
    }

    /// 关停：把所有脏缓存写回设备。此后的调用是使用者自己的竞态
    pub fn done(&self) {
        self.cache.sync_all();
        log::info!("file system flushed");
    }

    /// 调用者线程的初始当前目录，线程建立时装入、`chdir`换出
    pub fn root_dir(self: &Arc<Self>) -> Directory {
        Directory::open_root(self)
    }

    /// 扇区当前是否驻留在缓冲区缓存中
    pub fn cache_contains(&self, sector: u32) -> bool {
        self.cache.contains(sector)
    }

    /// 建一个名为`path`、初始长度`size`字节（内容清零）的普通文件
    pub fn create(
        self: &Arc<Self>,
        cwd: &Directory,
        path: &str,
        size: usize,
    ) -> Result<(), Error> {
        let (dir, name) = path::parse(self, cwd, path)?;
        if dir.inode().is_removed() {
            return Err(Error::RemovedParent);
        }

        let _guard = self.op_lock.lock();
        let sector = self
            .free_map
            .allocate(&self.cache, 1)
            .ok_or(Error::NoSpace)?;

        let result =
            Inode::create(self, sector, size, false).and_then(|()| dir.add(&name, sector));
        if let Err(e) = result {
            self.discard_inode(sector);
            return Err(e);
        }
        Ok(())
    }

    /// 打开文件（或目录）为文件句柄
    pub fn open_file(self: &Arc<Self>, cwd: &Directory, path: &str) -> Result<File, Error> {
        let (dir, name) = path::parse(self, cwd, path)?;
        if dir.inode().is_removed() {
            return Err(Error::RemovedParent);
        }

        let _guard = self.op_lock.lock();
        let inode = dir.lookup(&name).ok_or(Error::NotFound)?;
        Ok(File::new(inode))
    }

    /// 打开目录句柄，目标不是目录时失败
    pub fn open_dir(self: &Arc<Self>, cwd: &Directory, path: &str) -> Result<Directory, Error> {
        let (dir, name) = path::parse(self, cwd, path)?;
        if dir.inode().is_removed() {
            return Err(Error::RemovedParent);
        }

        let _guard = self.op_lock.lock();
        let inode = dir.lookup(&name).ok_or(Error::NotFound)?;
        Directory::open(inode)
    }

    /// 删除文件或**空**目录。已有的打开者照常读写，
    /// 扇区在最后一个打开者离开时回收
    pub fn remove(self: &Arc<Self>, cwd: &Directory, path: &str) -> Result<(), Error> {
        let (dir, name) = path::parse(self, cwd, path)?;
        if dir.inode().is_removed() {
            return Err(Error::RemovedParent);
        }

        let _guard = self.op_lock.lock();
        let inode = dir.lookup(&name).ok_or(Error::NotFound)?;

        if inode.is_dir() {
            // 除`.`与`..`外还有子项的目录不许删除
            let child = match Directory::open(inode.reopen()) {
                Ok(child) => child,
                Err(e) => {
                    inode.close();
                    return Err(e);
                }
            };
            let empty = loop {
                match child.readdir() {
                    Some(name) if name == "." || name == ".." => continue,
                    Some(_) => break false,
                    None => break true,
                }
            };
            drop(child);

            if !empty {
                inode.close();
                return Err(Error::DirectoryNotEmpty);
            }
        }

        let result = dir.remove(&name);
        inode.close();
        result
    }

    /// 建一个新目录；`.`与`..`就位之后才挂进父目录
    pub fn create_dir(self: &Arc<Self>, cwd: &Directory, path: &str) -> Result<(), Error> {
        let (dir, name) = path::parse(self, cwd, path)?;
        if dir.inode().is_removed() {
            return Err(Error::RemovedParent);
        }

        let _guard = self.op_lock.lock();
        let sector = self
            .free_map
            .allocate(&self.cache, 1)
            .ok_or(Error::NoSpace)?;

        let result = Directory::create(self, sector, Directory::INITIAL_CAPACITY)
            .and_then(|()| Directory::open(Inode::open(self, sector)))
            .and_then(|new_dir| new_dir.init_dots(dir.inumber()))
            .and_then(|()| dir.add(&name, sector));
        if let Err(e) = result {
            self.discard_inode(sector);
            return Err(e);
        }
        Ok(())
    }

    /// 把调用者的当前目录切到`path`，目标必须是目录
    pub fn chdir(self: &Arc<Self>, cwd: &mut Directory, path: &str) -> Result<(), Error> {
        let (dir, name) = path::parse(self, cwd, path)?;

        let _guard = self.op_lock.lock();
        let inode = dir.lookup(&name).ok_or(Error::NotFound)?;
        *cwd = Directory::open(inode)?;
        Ok(())
    }
}

impl FileSystem {
    // 建到一半失败的inode：借道删除路径回收头部与已挂上的扇区
    fn discard_inode(self: &Arc<Self>, sector: u32) {
        let inode = Inode::open(self, sector);
        inode.mark_removed();
        inode.close();
    }
}
