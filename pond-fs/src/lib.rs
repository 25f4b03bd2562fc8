#![no_std]

extern crate alloc;

/* pond-fs 的整体架构，自上而下 */

// 文件系统门面：挂载/格式化，目录级操作的总入口
mod fs;
pub use fs::FileSystem;

// 文件句柄层：每个打开者独立的读写游标
mod file;
pub use file::File;

// 目录层：在目录inode的数据上维护定长目录项表
mod dir;
pub use dir::Directory;

// 路径解析层：把路径字符串化为 (父目录, 最终名)
mod path;

// 索引节点层：内存inode、打开表、文件增长与回收
mod vfs;
pub use vfs::Inode;

// 空闲扇区位图层：持久化的扇区分配器
mod free_map;

// 磁盘数据结构层：表示磁盘文件系统的数据结构
mod layout;

// 缓冲区缓存层：内存上的磁盘扇区数据缓存
mod block_cache;

mod error;
pub use error::Error;

#[cfg(test)]
mod test_device;

pub use block_dev::BlockDevice;

/// 合法inode的标识魔数
pub const INODE_MAGIC: u32 = 0x494e4f44;
/// 扇区大小(字节)
pub const SECTOR_SIZE: usize = 512;
/// 缓冲区缓存的槽位数
pub const CACHE_SLOTS: usize = 64;
/// 文件名的最大长度(字节)
pub const NAME_MAX: usize = 14;

/// 空闲扇区位图文件的inode所在扇区
pub const FREE_MAP_SECTOR: u32 = 0;
/// 根目录inode所在扇区
pub const ROOT_DIR_SECTOR: u32 = 1;

type DataBlock = [u8; SECTOR_SIZE];
