//! # 索引节点层
//!
//! 每个磁盘inode在内存中至多有一个代表：打开表按扇区号索引到
//! 进程内唯一的[`Inode`]句柄，删除因此才是安全的：
//! 被标记删除的inode在最后一个打开者离开时才释放其全部扇区。
//!
//! 文件增长也发生在这一层：进入新扇区时从位图分配、清零并
//! 注册进索引结构，缺失的间接索引块按需物化。

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::layout::{DiskInode, SectorLocation, DIRECT_COUNT, INDIRECT_COUNT, MAX_LENGTH};
use crate::DataBlock;
use crate::Error;
use crate::FileSystem;
use crate::SECTOR_SIZE;

pub struct Inode {
    /// inode所在扇区，也是它对外的编号
    sector: u32,
    fs: Arc<FileSystem>,
    state: Mutex<State>,
    /// 文件增长的扩展锁：只覆盖长度扩展，不覆盖数据拷贝
    extend_lock: Mutex<()>,
}

struct State {
    open_cnt: usize,
    /// 0时允许写入，大于0时所有写入直接得0
    deny_write_cnt: usize,
    removed: bool,
}

/// 增长过程中的一笔分配及其指针槽，失败回滚时逆序撤销
struct Allocation {
    sector: u32,
    slot: PointerSlot,
}

enum PointerSlot {
    Direct(usize),
    IndirectRoot,
    DoubleRoot,
    Entry { parent: u32, index: usize },
}

impl Inode {
    /// 打开位于`sector`的inode，总是返回进程内的唯一句柄
    pub(crate) fn open(fs: &Arc<FileSystem>, sector: u32) -> Arc<Inode> {
        let mut table = fs.inodes.lock();

        if let Some(inode) = table.get(&sector) {
            inode.state.lock().open_cnt += 1;
            return Arc::clone(inode);
        }

        let inode = Arc::new(Inode {
            sector,
            fs: Arc::clone(fs),
            state: Mutex::new(State {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
            }),
            extend_lock: Mutex::new(()),
        });
        table.insert(sector, Arc::clone(&inode));

        inode
    }

    pub(crate) fn reopen(self: &Arc<Self>) -> Arc<Inode> {
        self.state.lock().open_cnt += 1;
        Arc::clone(self)
    }

    /// 注销一次打开。最后一个打开者离开时把inode移出打开表；
    /// 若此时已被标记删除，则归还它占用的所有扇区
    pub(crate) fn close(&self) {
        let mut table = self.fs.inodes.lock();
        let mut state = self.state.lock();
        assert!(state.open_cnt > 0);
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return;
        }

        table.remove(&self.sector);
        let removed = state.removed;
        drop(state);
        drop(table);

        if removed {
            self.release_sectors();
            self.fs.free_map.release(&self.fs.cache, self.sector, 1);
        }
    }

    /// 在`sector`写出一个新inode头，内容增长到`length`字节并清零。
    /// 增长失败时本次调用的分配全数回滚，扇区本身由调用者归还。
    pub(crate) fn create(
        fs: &Arc<FileSystem>,
        sector: u32,
        length: usize,
        is_dir: bool,
    ) -> Result<(), Error> {
        // 先落头部：之后的任何失败路径都能从一个合法的空inode回收
        fs.cache
            .get(sector)
            .lock()
            .map_mut(0, |disk: &mut DiskInode| disk.init(is_dir));

        if length > MAX_LENGTH {
            return Err(Error::OutOfRange);
        }

        if length > 0 {
            let inode = Inode::open(fs, sector);
            let result = inode.extend(0, length);
            if result.is_ok() {
                inode.on_disk_mut(|disk| disk.set_length(length));
            }
            inode.close();
            result?;
        }

        Ok(())
    }

    #[inline]
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    #[inline]
    pub(crate) fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn is_dir(&self) -> bool {
        self.on_disk(|disk| disk.is_dir())
    }

    pub fn length(&self) -> usize {
        self.on_disk(|disk| disk.length())
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub(crate) fn mark_removed(&self) {
        self.state.lock().removed = true;
    }

    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }

    /// 从指定位置读出数据填充`buf`，返回实际读取的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let disk = self.snapshot();
        disk.read_at(offset, buf, &self.fs.cache)
    }

    /// 把`buf`写入指定位置，写入越过文件末尾时先增长。
    /// 返回实际写入的字节数；写入被拒或增长失败时得0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        if self.state.lock().deny_write_cnt > 0 {
            return 0;
        }

        let end = offset + buf.len();
        {
            let _extend = self.extend_lock.lock();
            let old_length = self.length();
            if end > old_length {
                if self.extend(old_length, end).is_err() {
                    return 0;
                }
                // 扇区全部就位后才提交新长度；
                // 并发读者在此之前一直看到旧长度
                self.on_disk_mut(|disk| disk.set_length(end));
            }
        }

        // 数据拷贝不持有扩展锁，头部的修改由缓存层负责写回
        let disk = self.snapshot();
        disk.write_data_at(offset, buf, &self.fs.cache)
    }
}

impl Inode {
    /// 读取对磁盘的映射并处理
    fn on_disk<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        self.fs.cache.get(self.sector).lock().map(0, |disk: &DiskInode| {
            debug_assert!(disk.is_valid());
            f(disk)
        })
    }

    /// 以某种方式修改对磁盘的映射
    fn on_disk_mut<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        self.fs
            .cache
            .get(self.sector)
            .lock()
            .map_mut(0, |disk: &mut DiskInode| {
                debug_assert!(disk.is_valid());
                f(disk)
            })
    }

    /// 头部的整块副本，数据循环走副本即可，无需一直占着头部扇区
    fn snapshot(&self) -> DiskInode {
        self.on_disk(DiskInode::clone)
    }

    /// 为`[old_length, new_length)`就位扇区：
    /// 进入新扇区时分配、清零并注册；
    /// 起点落在已有扇区内时，就地清零到该扇区末尾。
    /// 中途失败时回滚本次调用的所有分配。
    fn extend(&self, old_length: usize, new_length: usize) -> Result<(), Error> {
        debug_assert!(old_length < new_length);

        let mut journal = Vec::new();
        let result = self.try_extend(old_length, new_length, &mut journal);
        if result.is_err() {
            self.rollback(&journal);
        }
        result
    }

    fn try_extend(
        &self,
        old_length: usize,
        new_length: usize,
        journal: &mut Vec<Allocation>,
    ) -> Result<(), Error> {
        let cache = &self.fs.cache;
        let mut pos = old_length;

        while pos < new_length {
            let sector_ofs = pos % SECTOR_SIZE;
            let location = DiskInode::locate(pos).ok_or(Error::OutOfRange)?;

            if sector_ofs > 0 {
                // 尾部扇区已经存在，清零当前偏移到扇区末尾
                let sector = self.snapshot().sector_in_slot(location, cache);
                assert_ne!(sector, 0);
                cache.get(sector).lock().map_mut(0, |block: &mut DataBlock| {
                    block[sector_ofs..].fill(0);
                });
                pos += SECTOR_SIZE - sector_ofs;
            } else {
                let sector = self
                    .fs
                    .free_map
                    .allocate(cache, 1)
                    .ok_or(Error::NoSpace)?;
                cache.get(sector).lock().zeroize();

                if let Err(e) = self.register(location, sector, journal) {
                    // 该扇区尚未挂进索引结构，单独归还
                    self.fs.free_map.release(cache, sector, 1);
                    return Err(e);
                }
                pos += SECTOR_SIZE;
            }
        }

        Ok(())
    }

    /// 把新数据扇区写进落点对应的指针槽，缺失的间接索引块按需分配并清零。
    /// 指针写入使用精确的块内偏移，不惊动同一索引块中的其它指针。
    fn register(
        &self,
        location: SectorLocation,
        sector: u32,
        journal: &mut Vec<Allocation>,
    ) -> Result<(), Error> {
        let cache = &self.fs.cache;

        match location {
            SectorLocation::Direct(index) => {
                self.on_disk_mut(|disk| disk.set_direct(index, sector));
                journal.push(Allocation {
                    sector,
                    slot: PointerSlot::Direct(index),
                });
            }
            SectorLocation::Indirect(index) => {
                let mut indirect = self.on_disk(|disk| disk.indirect());
                if indirect == 0 {
                    indirect = self
                        .fs
                        .free_map
                        .allocate(cache, 1)
                        .ok_or(Error::NoSpace)?;
                    cache.get(indirect).lock().zeroize();
                    self.on_disk_mut(|disk| disk.set_indirect(indirect));
                    journal.push(Allocation {
                        sector: indirect,
                        slot: PointerSlot::IndirectRoot,
                    });
                }

                write_entry(cache, indirect, index, sector);
                journal.push(Allocation {
                    sector,
                    slot: PointerSlot::Entry {
                        parent: indirect,
                        index,
                    },
                });
            }
            SectorLocation::DoubleIndirect(index1, index2) => {
                let mut double = self.on_disk(|disk| disk.double_indirect());
                if double == 0 {
                    double = self
                        .fs
                        .free_map
                        .allocate(cache, 1)
                        .ok_or(Error::NoSpace)?;
                    cache.get(double).lock().zeroize();
                    self.on_disk_mut(|disk| disk.set_double_indirect(double));
                    journal.push(Allocation {
                        sector: double,
                        slot: PointerSlot::DoubleRoot,
                    });
                }

                let mut level2 = read_entry(cache, double, index1);
                if level2 == 0 {
                    level2 = self
                        .fs
                        .free_map
                        .allocate(cache, 1)
                        .ok_or(Error::NoSpace)?;
                    cache.get(level2).lock().zeroize();
                    write_entry(cache, double, index1, level2);
                    journal.push(Allocation {
                        sector: level2,
                        slot: PointerSlot::Entry {
                            parent: double,
                            index: index1,
                        },
                    });
                }

                write_entry(cache, level2, index2, sector);
                journal.push(Allocation {
                    sector,
                    slot: PointerSlot::Entry {
                        parent: level2,
                        index: index2,
                    },
                });
            }
        }

        Ok(())
    }

    // 逆序撤销：先清指针槽再归还扇区，子项总是先于其父表退场
    fn rollback(&self, journal: &[Allocation]) {
        let cache = &self.fs.cache;

        for Allocation { sector, slot } in journal.iter().rev() {
            match *slot {
                PointerSlot::Direct(index) => self.on_disk_mut(|disk| disk.set_direct(index, 0)),
                PointerSlot::IndirectRoot => self.on_disk_mut(|disk| disk.set_indirect(0)),
                PointerSlot::DoubleRoot => self.on_disk_mut(|disk| disk.set_double_indirect(0)),
                PointerSlot::Entry { parent, index } => write_entry(cache, parent, index, 0),
            }
            self.fs.free_map.release(cache, *sector, 1);
        }
    }

    /// 释放inode引用的全部扇区：直接项、一级表的每一项、
    /// 二级表每个下级表的每一项，最后是间接索引块本身
    fn release_sectors(&self) {
        let cache = &self.fs.cache;
        let free_map = &self.fs.free_map;
        let disk = self.snapshot();

        for index in 0..DIRECT_COUNT {
            let sector = disk.direct(index);
            if sector != 0 {
                free_map.release(cache, sector, 1);
            }
        }

        let indirect = disk.indirect();
        if indirect != 0 {
            for index in 0..INDIRECT_COUNT {
                let sector = read_entry(cache, indirect, index);
                if sector != 0 {
                    free_map.release(cache, sector, 1);
                }
            }
            free_map.release(cache, indirect, 1);
        }

        let double = disk.double_indirect();
        if double != 0 {
            for index1 in 0..INDIRECT_COUNT {
                let level2 = read_entry(cache, double, index1);
                if level2 == 0 {
                    continue;
                }
                for index2 in 0..INDIRECT_COUNT {
                    let sector = read_entry(cache, level2, index2);
                    if sector != 0 {
                        free_map.release(cache, sector, 1);
                    }
                }
                free_map.release(cache, level2, 1);
            }
            free_map.release(cache, double, 1);
        }
    }
}

/// 读出间接索引块内第`index`项
fn read_entry(cache: &BufferCache, block: u32, index: usize) -> u32 {
    cache
        .get(block)
        .lock()
        .map(DiskInode::map_table_offset(index), |entry: &u32| *entry)
}

/// 改写间接索引块内第`index`项
fn write_entry(cache: &BufferCache, block: u32, index: usize, value: u32) {
    cache
        .get(block)
        .lock()
        .map_mut(DiskInode::map_table_offset(index), |entry: &mut u32| {
            *entry = value
        })
}
