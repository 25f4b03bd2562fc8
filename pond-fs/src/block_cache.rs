//! # 缓冲区缓存层
//!
//! 扇区读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的槽位，
//! 把即将操作的扇区复制到内存中，提高对块设备的操作效率。
//! 同时，缓存层也会尝试返回已缓存的扇区。
//!
//! 缓存策略为**写回**：修改只落在缓存上，直到该槽位被时钟算法选为牺牲者、
//! 被显式同步或整个缓存被丢弃，才写回设备。
//!
//! 对使用者来说缓存是透明的：所有扇区操作都经过缓存层，
//! 且**操作扇区时一定在缓存当中**。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use block_dev::BlockDevice;
use spin::Mutex;

use crate::CACHE_SLOTS;
use crate::DataBlock;
use crate::SECTOR_SIZE;

pub(crate) struct BufferCache {
    device: Arc<dyn BlockDevice>,
    manager: Mutex<Manager>,
}

struct Manager {
    slots: Vec<Slot>,
    /// 时钟指针，指向下一个候选牺牲槽位
    clock_hand: usize,
}

struct Slot {
    /// 槽位当前缓存的扇区号，空槽为`None`
    sector: Option<u32>,
    /// 最近使用标记，由时钟算法消耗
    clock_bit: bool,
    head: Arc<Mutex<BufferHead>>,
}

/// 内存中的扇区缓存
pub(crate) struct BufferHead {
    /// 缓存的数据
    data: DataBlock,
    /// 对应的扇区号
    sector: u32,
    /// 数据是否与某个扇区对应
    valid: bool,
    /// 是否为脏块
    modified: bool,
    /// 底层块设备的引用
    device: Arc<dyn BlockDevice>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = (0..CACHE_SLOTS)
            .map(|_| Slot {
                sector: None,
                clock_bit: false,
                head: Arc::new(Mutex::new(BufferHead {
                    data: [0; SECTOR_SIZE],
                    sector: 0,
                    valid: false,
                    modified: false,
                    device: device.clone(),
                })),
            })
            .collect();

        Self {
            device,
            manager: Mutex::new(Manager {
                slots,
                clock_hand: 0,
            }),
        }
    }

    /// 取出`sector`对应的缓存槽位，必要时通过时钟算法腾出一个槽位并从设备换入。
    ///
    /// 查找命中即持有`Arc`，其引用计数将槽位钉住，
    /// 换出流程不会偷走一个正被拷贝的槽位。
    pub fn get(&self, sector: u32) -> Arc<Mutex<BufferHead>> {
        let mut manager = self.manager.lock();

        // 尝试从缓存中找到扇区
        if let Some(slot) = manager
            .slots
            .iter_mut()
            .find(|slot| slot.sector == Some(sector))
        {
            slot.clock_bit = true;
            return Arc::clone(&slot.head);
        }

        // 未命中：选择牺牲槽位并换入
        let index = manager.select_victim();
        let slot = &mut manager.slots[index];
        slot.sector = Some(sector);
        slot.clock_bit = true;
        let head = Arc::clone(&slot.head);

        // 先锁住槽位再放开管理器；
        // 并发的同扇区查找会命中新标记并阻塞在此锁上，直到换入完成
        let mut guard = head.lock();
        drop(manager);

        if guard.modified {
            log::trace!("buffer cache: write back sector {}", guard.sector);
        }
        guard.sync();
        guard.valid = false;
        guard.sector = sector;
        self.device.read_sector(sector as usize, &mut guard.data);
        guard.valid = true;
        drop(guard);

        head
    }

    /// 把所有脏槽位写回设备
    pub fn sync_all(&self) {
        // 每次只取一个句柄：既不在管理器锁内等待被占用的槽位，
        // 也不会一口气钉住全部槽位、饿死并发的牺牲者选择
        for index in 0..CACHE_SLOTS {
            let head = {
                let manager = self.manager.lock();
                let slot = &manager.slots[index];
                if slot.sector.is_none() {
                    continue;
                }
                Arc::clone(&slot.head)
            };
            head.lock().sync();
        }
    }

    /// 扇区当前是否驻留在缓存中
    pub fn contains(&self, sector: u32) -> bool {
        self.manager
            .lock()
            .slots
            .iter()
            .any(|slot| slot.sector == Some(sector))
    }
}

impl Manager {
    // 时钟替换：指针扫过槽位，消耗最近使用标记；
    // 被外部`Arc`钉住的槽位不能作为牺牲者
    fn select_victim(&mut self) -> usize {
        let mut pinned = 0;

        loop {
            let index = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.slots.len();

            let slot = &mut self.slots[index];
            if Arc::strong_count(&slot.head) > 1 {
                pinned += 1;
                assert!(pinned < self.slots.len() * 2, "run out of buffer cache");
                continue;
            }
            pinned = 0;

            if slot.clock_bit {
                slot.clock_bit = false;
                continue;
            }

            slot.sector = None;
            return index;
        }
    }
}

impl BufferHead {
    /// 若为脏块则写回设备
    pub fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.device.write_sector(self.sector as usize, &self.data);
        }
    }

    pub fn get<T: Sized>(&self, offset: usize) -> &T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= SECTOR_SIZE);
        debug_assert!(self.valid);
        let addr = self.offset(offset).cast();
        unsafe { &*addr }
    }

    pub fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= SECTOR_SIZE);
        debug_assert!(self.valid);
        self.modified = true;
        let addr = self.offset(offset).cast_mut().cast();
        unsafe { &mut *addr }
    }

    #[inline]
    pub fn map<T: Sized, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn map_mut<T: Sized, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    #[inline]
    pub fn zeroize(&mut self) {
        self.data.fill(0);
        self.modified = true;
    }
}

impl BufferHead {
    #[inline]
    fn offset(&self, count: usize) -> *const u8 {
        &self.data[count]
    }
}

impl Drop for BufferHead {
    fn drop(&mut self) {
        self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::TestDisk;

    #[test]
    fn hit_returns_same_slot() {
        let disk = Arc::new(TestDisk::new(128));
        let cache = BufferCache::new(disk);

        let a = cache.get(3);
        let b = cache.get(3);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let disk = Arc::new(TestDisk::new(CACHE_SLOTS * 4));
        let cache = BufferCache::new(disk.clone());

        cache
            .get(7)
            .lock()
            .map_mut(0, |block: &mut DataBlock| block.fill(0xAB));

        // 触满所有槽位，迫使时钟算法换出扇区7
        for sector in 100..100 + CACHE_SLOTS as u32 {
            cache.get(sector);
        }
        assert!(!cache.contains(7));
        assert_eq!(disk.raw(7)[0], 0xAB);

        // 重新换入后读到写回的数据
        let value = cache.get(7).lock().map(0, |block: &DataBlock| block[0]);
        assert_eq!(value, 0xAB);
    }

    #[test]
    fn clock_spares_recently_used_slot() {
        let disk = Arc::new(TestDisk::new(CACHE_SLOTS * 4));
        let cache = BufferCache::new(disk);

        for sector in 0..CACHE_SLOTS as u32 {
            cache.get(sector);
        }
        // 所有时钟标记都为新，整轮扫描消耗标记后换出指针起点的扇区0
        cache.get(CACHE_SLOTS as u32);
        assert!(!cache.contains(0));

        // 重新触碰扇区1，它在下一次选择中获得第二次机会
        cache.get(1);
        cache.get(CACHE_SLOTS as u32 + 1);
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }
}
