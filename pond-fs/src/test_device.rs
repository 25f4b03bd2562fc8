//! 单元测试用的内存盘

use alloc::vec;
use alloc::vec::Vec;

use block_dev::BlockDevice;
use spin::Mutex;

use crate::SECTOR_SIZE;

pub(crate) struct TestDisk {
    sectors: usize,
    data: Mutex<Vec<u8>>,
}

impl TestDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0; sectors * SECTOR_SIZE]),
        }
    }

    /// 越过缓存直接读取设备内容
    pub fn raw(&self, sector: usize) -> Vec<u8> {
        let data = self.data.lock();
        data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].to_vec()
    }
}

impl BlockDevice for TestDisk {
    fn sector_count(&self) -> usize {
        self.sectors
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let data = self.data.lock();
        buf.copy_from_slice(&data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut data = self.data.lock();
        data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].copy_from_slice(buf);
    }
}
