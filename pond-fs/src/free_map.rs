//! # 空闲扇区位图层
//!
//! 设备的每个扇区在位图中占一位，位图本身持久化在一个专用文件里：
//! 其inode固定在扇区0，数据紧跟根目录inode之后连续摆放。
//! 位图的读写全部经过缓冲区缓存，没有任何私有的扇区副本。

use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::layout::{DiskInode, DIRECT_COUNT};
use crate::FREE_MAP_SECTOR;
use crate::SECTOR_SIZE;

/// 位图数据扇区内的组结构
type BitmapBlock = [u64; SECTOR_SIZE / 8];

/// 单个位图扇区记录的位数
const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

/// 位图文件数据的起始扇区
const FREE_MAP_DATA_START: u32 = 2;

pub(crate) struct FreeMap {
    /// 位图数据占用的扇区数
    sectors: usize,
    /// 设备扇区总数，即位图的有效位数
    capacity: usize,
    /// 「找到空位」与「置位」必须不可分割，否则会重复分配
    lock: Mutex<()>,
}

impl FreeMap {
    /// 在格式化时创建位图文件：写出inode、清空数据扇区，
    /// 并把保留区（两个保留inode与位图数据本身）标记为已占用。
    pub fn format(cache: &BufferCache, capacity: usize) -> Self {
        let sectors = capacity.div_ceil(BITS_PER_SECTOR);
        // 位图数据只用直接索引摆放
        assert!(sectors <= DIRECT_COUNT, "device too large for free map");

        for index in 0..sectors {
            cache
                .get(FREE_MAP_DATA_START + index as u32)
                .lock()
                .zeroize();
        }

        cache
            .get(FREE_MAP_SECTOR)
            .lock()
            .map_mut(0, |inode: &mut DiskInode| {
                inode.init(false);
                inode.set_length(capacity.div_ceil(8));
                for index in 0..sectors {
                    inode.set_direct(index, FREE_MAP_DATA_START + index as u32);
                }
            });

        let free_map = Self {
            sectors,
            capacity,
            lock: Mutex::new(()),
        };
        for sector in 0..FREE_MAP_DATA_START as usize + sectors {
            free_map.set(cache, sector);
        }

        free_map
    }

    /// 从已格式化的设备装载位图
    pub fn open(cache: &BufferCache, capacity: usize) -> Self {
        let length = cache
            .get(FREE_MAP_SECTOR)
            .lock()
            .map(0, |inode: &DiskInode| {
                assert!(inode.is_valid() && !inode.is_dir(), "bad free map inode");
                inode.length()
            });
        assert_eq!(length, capacity.div_ceil(8), "free map size mismatch");

        Self {
            sectors: capacity.div_ceil(BITS_PER_SECTOR),
            capacity,
            lock: Mutex::new(()),
        }
    }

    /// 寻找`n`个连续的空闲扇区并全部置位，返回第一个扇区号。
    /// 位图空间不足时返回空。
    pub fn allocate(&self, cache: &BufferCache, n: usize) -> Option<u32> {
        assert!(n > 0);
        let _guard = self.lock.lock();

        let mut run_start = 0;
        let mut run_len = 0;

        'scan: for block_index in 0..self.sectors {
            // 整块拷出再逐位检查；置位仍走缓存，由本层的锁保证先后一致
            let bits: BitmapBlock = cache
                .get(FREE_MAP_DATA_START + block_index as u32)
                .lock()
                .map(0, |bits: &BitmapBlock| *bits);

            for (group_index, &group) in bits.iter().enumerate() {
                // 组内已占满，连续段就此断裂
                if group == u64::MAX {
                    run_len = 0;
                    continue;
                }

                for bit_index in 0..u64::BITS as usize {
                    let bit = block_index * BITS_PER_SECTOR + group_index * 64 + bit_index;
                    if bit >= self.capacity {
                        break 'scan;
                    }

                    if group & (1 << bit_index) == 0 {
                        if run_len == 0 {
                            run_start = bit;
                        }
                        run_len += 1;
                        if run_len == n {
                            for sector in run_start..run_start + n {
                                self.set(cache, sector);
                            }
                            return Some(run_start as u32);
                        }
                    } else {
                        run_len = 0;
                    }
                }
            }
        }

        log::debug!("free map exhausted: no run of {n} free sectors");
        None
    }

    /// 释放从`first`开始的`n`个扇区
    pub fn release(&self, cache: &BufferCache, first: u32, n: usize) {
        let _guard = self.lock.lock();
        for sector in first as usize..first as usize + n {
            self.clear(cache, sector);
        }
    }
}

impl FreeMap {
    fn set(&self, cache: &BufferCache, bit: usize) {
        debug_assert!(bit < self.capacity);
        let (sector, group, offset) = Self::position(bit);
        cache.get(sector).lock().map_mut(0, |bits: &mut BitmapBlock| {
            debug_assert_eq!(bits[group] & (1 << offset), 0);
            bits[group] |= 1 << offset;
        });
    }

    fn clear(&self, cache: &BufferCache, bit: usize) {
        debug_assert!(bit < self.capacity);
        let (sector, group, offset) = Self::position(bit);
        cache.get(sector).lock().map_mut(0, |bits: &mut BitmapBlock| {
            // 编号一定得有对应的位
            assert_ne!(bits[group] & (1 << offset), 0);
            bits[group] &= !(1 << offset);
        });
    }

    /// 位编号线性映射为(位图扇区, 组, 组内偏移)
    #[inline]
    fn position(bit: usize) -> (u32, usize, usize) {
        let sector = FREE_MAP_DATA_START + (bit / BITS_PER_SECTOR) as u32;
        let bit = bit % BITS_PER_SECTOR;
        (sector, bit / 64, bit % 64)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::test_device::TestDisk;

    fn setup(sectors: usize) -> (BufferCache, FreeMap) {
        let disk = Arc::new(TestDisk::new(sectors));
        let cache = BufferCache::new(disk);
        let free_map = FreeMap::format(&cache, sectors);
        (cache, free_map)
    }

    #[test]
    fn first_fit_after_reserved_area() {
        let (cache, free_map) = setup(64);

        // 扇区0、1与位图数据扇区2已被保留
        assert_eq!(free_map.allocate(&cache, 1), Some(3));
        assert_eq!(free_map.allocate(&cache, 1), Some(4));

        free_map.release(&cache, 3, 1);
        assert_eq!(free_map.allocate(&cache, 1), Some(3));
    }

    #[test]
    fn contiguous_run_skips_holes() {
        let (cache, free_map) = setup(64);

        assert_eq!(free_map.allocate(&cache, 1), Some(3));
        assert_eq!(free_map.allocate(&cache, 1), Some(4));
        free_map.release(&cache, 3, 1);

        // 扇区3是孤立空位，长度2的连续段从5开始
        assert_eq!(free_map.allocate(&cache, 2), Some(5));
        assert_eq!(free_map.allocate(&cache, 1), Some(3));
    }

    #[test]
    fn exhaustion_returns_none() {
        let (cache, free_map) = setup(16);

        // 13个空闲扇区
        assert_eq!(free_map.allocate(&cache, 13), Some(3));
        assert_eq!(free_map.allocate(&cache, 1), None);

        free_map.release(&cache, 8, 2);
        assert_eq!(free_map.allocate(&cache, 3), None);
        assert_eq!(free_map.allocate(&cache, 2), Some(8));
    }

    #[test]
    fn survives_reload() {
        let disk = Arc::new(TestDisk::new(64));
        let cache = BufferCache::new(disk);
        let free_map = FreeMap::format(&cache, 64);
        assert_eq!(free_map.allocate(&cache, 1), Some(3));

        let reopened = FreeMap::open(&cache, 64);
        assert_eq!(reopened.allocate(&cache, 1), Some(4));
    }
}
