//! 磁盘inode与间接索引块
//!
//! 每个inode独占一个扇区，前123项为直接索引；
//! 其后是一个一级间接索引与一个二级间接索引，
//! 索引块整个扇区连续存储**扇区号**，编号0表示未分配。
//!
//! ## 字节偏移的编址
//!
//! - 偏移所在的逻辑扇区小于123：直接索引
//! - 再往后128个逻辑扇区：一级间接索引
//! - 再往后128×128个逻辑扇区：二级间接索引
//! - 更远处不可编址

use core::mem;

use crate::block_cache::BufferCache;
use crate::DataBlock;
use crate::INODE_MAGIC;
use crate::SECTOR_SIZE;

/// 间接索引块的编号容量
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;

/// 直接索引可编号数量
pub const DIRECT_COUNT: usize = 123;
/// 用上一级索引时的编号容量
const INDIRECT1_CAP: usize = DIRECT_COUNT + INDIRECT_COUNT;
/// 用上二级索引时的编号容量
const INDIRECT2_CAP: usize = INDIRECT1_CAP + INDIRECT_COUNT * INDIRECT_COUNT;

/// 单个inode可编址的最大字节长度
pub const MAX_LENGTH: usize = INDIRECT2_CAP * SECTOR_SIZE;

#[derive(Clone)]
#[repr(C)]
pub struct DiskInode {
    /// 直接索引表
    direct: [u32; DIRECT_COUNT],
    /// 指向一级间接索引块
    indirect: u32,
    /// 指向二级间接索引块
    double_indirect: u32,
    /// 文件数据的字节长度
    length: i32,
    /// 合法inode的标识魔数
    magic: u32,
    /// 目录标志
    is_dir: u32,
}

/// 字节偏移在索引结构中的落点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorLocation {
    Direct(usize),
    Indirect(usize),
    /// (一级表内索引, 二级表内索引)
    DoubleIndirect(usize, usize),
}

impl DiskInode {
    pub fn init(&mut self, is_dir: bool) {
        *self = Self {
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            double_indirect: 0,
            length: 0,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
        };
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    #[inline]
    pub fn length(&self) -> usize {
        debug_assert!(self.length >= 0);
        self.length as usize
    }

    #[inline]
    pub fn set_length(&mut self, length: usize) {
        debug_assert!(length <= MAX_LENGTH);
        self.length = length as i32;
    }

    #[inline]
    pub fn direct(&self, index: usize) -> u32 {
        self.direct[index]
    }

    #[inline]
    pub fn set_direct(&mut self, index: usize, sector: u32) {
        self.direct[index] = sector;
    }

    #[inline]
    pub fn indirect(&self) -> u32 {
        self.indirect
    }

    #[inline]
    pub fn set_indirect(&mut self, sector: u32) {
        self.indirect = sector;
    }

    #[inline]
    pub fn double_indirect(&self) -> u32 {
        self.double_indirect
    }

    #[inline]
    pub fn set_double_indirect(&mut self, sector: u32) {
        self.double_indirect = sector;
    }

    /// 字节偏移在索引结构中的落点；超出可编址范围时为空
    pub fn locate(pos: usize) -> Option<SectorLocation> {
        let index = pos / SECTOR_SIZE;

        if index < DIRECT_COUNT {
            Some(SectorLocation::Direct(index))
        } else if index < INDIRECT1_CAP {
            Some(SectorLocation::Indirect(index - DIRECT_COUNT))
        } else if index < INDIRECT2_CAP {
            let index = index - INDIRECT1_CAP;
            Some(SectorLocation::DoubleIndirect(
                index / INDIRECT_COUNT,
                index % INDIRECT_COUNT,
            ))
        } else {
            None
        }
    }

    /// 索引块内第`index`项的字节偏移
    #[inline]
    pub fn map_table_offset(index: usize) -> usize {
        index * mem::size_of::<u32>()
    }

    /// 取出落点指向的扇区号，未分配的层级一律得0。
    ///
    /// 间接索引块从不复制到堆上，每次遍历都经过缓存就地读取。
    pub fn sector_in_slot(&self, location: SectorLocation, cache: &BufferCache) -> u32 {
        match location {
            SectorLocation::Direct(index) => self.direct[index],
            SectorLocation::Indirect(index) => {
                if self.indirect == 0 {
                    return 0;
                }
                cache
                    .get(self.indirect)
                    .lock()
                    .map(Self::map_table_offset(index), |entry: &u32| *entry)
            }
            SectorLocation::DoubleIndirect(index1, index2) => {
                if self.double_indirect == 0 {
                    return 0;
                }
                let level2 = cache
                    .get(self.double_indirect)
                    .lock()
                    .map(Self::map_table_offset(index1), |entry: &u32| *entry);
                if level2 == 0 {
                    return 0;
                }
                cache
                    .get(level2)
                    .lock()
                    .map(Self::map_table_offset(index2), |entry: &u32| *entry)
            }
        }
    }

    /// 包含字节偏移`pos`的扇区号；偏移不落在`[0, length)`内或扇区未分配时得0
    pub fn sector_for_byte(&self, pos: usize, cache: &BufferCache) -> u32 {
        if pos >= self.length() {
            return 0;
        }
        Self::locate(pos)
            .map(|location| self.sector_in_slot(location, cache))
            .unwrap_or(0)
    }

    /// 从指定位置(字节偏移)读出数据填充`buf`，返回实际读取的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8], cache: &BufferCache) -> usize {
        let mut start = offset;
        let end = (start + buf.len()).min(self.length());

        if start >= end {
            return 0;
        }

        let mut read_size = 0;
        while start < end {
            let sector = self.sector_for_byte(start, cache);
            // 编号0即未分配，视作文件结束
            if sector == 0 {
                break;
            }

            let sector_ofs = start % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(end - start);
            let dest = &mut buf[read_size..read_size + chunk];

            cache.get(sector).lock().map(0, |block: &DataBlock| {
                dest.copy_from_slice(&block[sector_ofs..sector_ofs + chunk]);
            });

            read_size += chunk;
            start += chunk;
        }

        read_size
    }

    /// 把`buf`写入指定位置，不越过`length`，返回实际写入的字节数。
    ///
    /// 所需扇区必须已经分配；文件增长在索引节点层完成。
    pub fn write_data_at(&self, offset: usize, buf: &[u8], cache: &BufferCache) -> usize {
        let mut start = offset;
        let end = (start + buf.len()).min(self.length());

        if start >= end {
            return 0;
        }

        let mut written_size = 0;
        while start < end {
            let sector = self.sector_for_byte(start, cache);
            if sector == 0 {
                break;
            }

            let sector_ofs = start % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(end - start);
            let src = &buf[written_size..written_size + chunk];

            cache.get(sector).lock().map_mut(0, |block: &mut DataBlock| {
                block[sector_ofs..sector_ofs + chunk].copy_from_slice(src);
            });

            written_size += chunk;
            start += chunk;
        }

        written_size
    }
}
