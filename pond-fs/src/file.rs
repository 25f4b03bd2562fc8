//! # 文件句柄层
//!
//! 同一inode可以被打开多次，每个打开者持有独立的读写游标；
//! 拒写在inode上计数，在句柄上去重。

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::vfs::Inode;

pub struct File {
    inode: Arc<Inode>,
    inner: Mutex<FileInner>,
}

struct FileInner {
    /// 读写游标(字节)
    pos: usize,
    /// 本句柄是否已在inode上计入一次拒写
    denied: bool,
}

impl File {
    pub(crate) fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            inner: Mutex::new(FileInner {
                pos: 0,
                denied: false,
            }),
        }
    }

    /// 从游标处读取，游标前进实际读取的字节数
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let read_size = self.inode.read_at(inner.pos, buf);
        inner.pos += read_size;
        read_size
    }

    /// 向游标处写入，游标前进实际写入的字节数。
    /// 拒写生效期间得0，文件长度与扇区都原样不动
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let written_size = self.inode.write_at(inner.pos, buf);
        inner.pos += written_size;
        written_size
    }

    /// 移动游标。允许越过文件末尾，空洞留待下一次写入时补零
    pub fn seek(&self, pos: usize) {
        self.inner.lock().pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.inner.lock().pos
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    /// 拒绝所有打开者对该inode的写入；同一句柄重复调用只计一次
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        if !inner.denied {
            inner.denied = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        if inner.denied {
            inner.denied = false;
            self.inode.allow_write();
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("inode", &self.inode.inumber())
            .field("pos", &self.inner.lock().pos)
            .finish()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // 句柄欠下的拒写计数随句柄一并撤销
        self.allow_write();
        self.inode.close();
    }
}
