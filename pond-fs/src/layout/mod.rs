//! # 磁盘数据结构层
//!
//! 磁盘布局（小端、逐位确定）：
//! 扇区0为空闲位图文件的inode，扇区1为根目录inode，
//! 其后紧跟位图数据扇区，再往后由位图分配器统一支配。

mod inode;
pub use inode::{DiskInode, SectorLocation, DIRECT_COUNT, INDIRECT_COUNT, MAX_LENGTH};

mod dir_entry;
pub use dir_entry::DirEntry;
