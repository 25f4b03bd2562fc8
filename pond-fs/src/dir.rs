//! # 目录层
//!
//! 目录就是一个`is_dir`置位的inode，其数据是一张定长目录项表；
//! `in_use`为0的槽位可以复用，槽位用尽时目录像普通文件一样增长。
//! 每个非删除目录在创建后都含有`.`与`..`两项，根目录的`..`指向自身。

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::layout::DirEntry;
use crate::vfs::Inode;
use crate::Error;
use crate::FileSystem;
use crate::NAME_MAX;
use crate::ROOT_DIR_SECTOR;

/// 目录句柄，持有自己的`readdir`游标
pub struct Directory {
    inode: Arc<Inode>,
    pos: Mutex<usize>,
}

impl Directory {
    /// 新目录预留的目录项数
    pub(crate) const INITIAL_CAPACITY: usize = 16;

    /// 在`sector`创建一个空目录inode，预留`capacity`个目录项的空间
    pub(crate) fn create(fs: &Arc<FileSystem>, sector: u32, capacity: usize) -> Result<(), Error> {
        Inode::create(fs, sector, capacity * DirEntry::SIZE, true)
    }

    /// 把一个已打开的inode收作目录句柄；不是目录时原样关闭
    pub(crate) fn open(inode: Arc<Inode>) -> Result<Self, Error> {
        if !inode.is_dir() {
            inode.close();
            return Err(Error::NotADirectory);
        }
        Ok(Self {
            inode,
            pos: Mutex::new(0),
        })
    }

    pub(crate) fn open_root(fs: &Arc<FileSystem>) -> Directory {
        Directory {
            inode: Inode::open(fs, ROOT_DIR_SECTOR),
            pos: Mutex::new(0),
        }
    }

    /// 同一目录的新句柄，游标独立归零
    pub fn reopen(&self) -> Directory {
        Directory {
            inode: self.inode.reopen(),
            pos: Mutex::new(0),
        }
    }

    #[inline]
    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    #[inline]
    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// 线性扫描名字对应的目录项，命中即打开它引用的inode
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Inode>> {
        let (_, entry) = self.find(name)?;
        Some(Inode::open(self.inode.fs(), entry.inode_sector()))
    }

    /// 新目录项写进空槽位；没有空槽位时目录自然增长
    pub(crate) fn add(&self, name: &str, inode_sector: u32) -> Result<(), Error> {
        assert!(!name.is_empty());
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        if self.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let offset = self.free_slot();
        let entry = DirEntry::new(name, inode_sector);
        if self.inode.write_at(offset, entry.as_bytes()) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// 摘除名字对应的目录项，其inode待最后一个打开者离开时回收
    pub(crate) fn remove(&self, name: &str) -> Result<(), Error> {
        let (offset, mut entry) = self.find(name).ok_or(Error::NotFound)?;

        let inode = Inode::open(self.inode.fs(), entry.inode_sector());
        inode.mark_removed();
        entry.clear();
        assert_eq!(self.inode.write_at(offset, entry.as_bytes()), DirEntry::SIZE);
        inode.close();
        Ok(())
    }

    /// 返回下一个在用目录项的名字并前移游标，到尾时为空
    pub fn readdir(&self) -> Option<String> {
        let mut pos = self.pos.lock();
        let size = self.inode.length();
        let mut entry = DirEntry::default();

        while *pos < size {
            assert_eq!(
                self.inode.read_at(*pos, entry.as_bytes_mut()),
                DirEntry::SIZE
            );
            *pos += DirEntry::SIZE;
            if entry.is_in_use() {
                return Some(String::from(entry.name()));
            }
        }

        None
    }

    /// 初始化新目录的`.`与`..`
    pub(crate) fn init_dots(&self, parent_sector: u32) -> Result<(), Error> {
        self.add(".", self.inumber())?;
        self.add("..", parent_sector)
    }
}

impl Directory {
    /// 按目录项步长扫描，返回命中项及其字节偏移
    fn find(&self, name: &str) -> Option<(usize, DirEntry)> {
        let size = self.inode.length();
        let mut entry = DirEntry::default();

        for offset in (0..size).step_by(DirEntry::SIZE) {
            assert_eq!(
                self.inode.read_at(offset, entry.as_bytes_mut()),
                DirEntry::SIZE
            );
            if entry.is_in_use() && entry.name() == name {
                return Some((offset, entry));
            }
        }

        None
    }

    /// 第一个空槽位的偏移；表满时为表尾，写入将使目录增长
    fn free_slot(&self) -> usize {
        let size = self.inode.length();
        let mut entry = DirEntry::default();

        for offset in (0..size).step_by(DirEntry::SIZE) {
            assert_eq!(
                self.inode.read_at(offset, entry.as_bytes_mut()),
                DirEntry::SIZE
            );
            if !entry.is_in_use() {
                return offset;
            }
        }

        size
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("inode", &self.inode.inumber())
            .finish()
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        self.inode.close();
    }
}
