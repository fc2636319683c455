use super::*;
use block_device::BlockDevice;

use log::debug;

/// byte values of a slot on disk
pub const SLOT_FREE: u8 = 1;
pub const SLOT_USED: u8 = 0;

/// One byte per slot, first-fit.
pub struct BitMap {
    start: u64,
    slots: usize,
}

impl BitMap {
    pub fn new(start: u64, slots: usize) -> Self {
        Self { start, slots }
    }

    /// Raw slot bytes, `SLOT_FREE` or `SLOT_USED`.
    pub fn load(&self, blk_dev: &dyn BlockDevice) -> Result<Vec<u8>> {
        let mut map = vec![0u8; self.slots];
        blk_dev.read_at(self.start, &mut map)?;
        Ok(map)
    }

    /// The first `reserved` slots used, the rest free.
    pub fn format(&self, blk_dev: &dyn BlockDevice, reserved: usize) -> Result<()> {
        let mut map = vec![SLOT_FREE; self.slots];
        map.iter_mut().take(reserved).for_each(|slot| *slot = SLOT_USED);
        blk_dev.write_at(self.start, &map)?;
        Ok(())
    }

    /// Takes the first free slot, `None` when every slot is used.
    pub fn alloc(&self, blk_dev: &dyn BlockDevice) -> Result<Option<usize>> {
        let map = self.load(blk_dev)?;
        match map.iter().position(|&slot| slot == SLOT_FREE) {
            Some(index) => {
                self.set(blk_dev, index, SLOT_USED)?;
                debug!("bitmap@{}: alloc slot {index}", self.start);
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    /// Frees a used slot. Out-of-range and already-free slots are rejected.
    pub fn dealloc(&self, blk_dev: &dyn BlockDevice, index: usize) -> Result<()> {
        if self.is_free(blk_dev, index)? {
            return Err(FsError::inconsistent(format!(
                "bitmap@{}: slot {index} freed twice",
                self.start
            )));
        }
        self.set(blk_dev, index, SLOT_FREE)?;
        debug!("bitmap@{}: dealloc slot {index}", self.start);
        Ok(())
    }

    pub fn mark_used(&self, blk_dev: &dyn BlockDevice, index: usize) -> Result<()> {
        self.check(index)?;
        self.set(blk_dev, index, SLOT_USED)
    }

    pub fn is_free(&self, blk_dev: &dyn BlockDevice, index: usize) -> Result<bool> {
        self.check(index)?;
        let mut slot = [0u8; 1];
        blk_dev.read_at(self.start + index as u64, &mut slot)?;
        Ok(slot[0] == SLOT_FREE)
    }

    pub fn count_free(&self, blk_dev: &dyn BlockDevice) -> Result<usize> {
        Ok(self
            .load(blk_dev)?
            .iter()
            .filter(|&&slot| slot == SLOT_FREE)
            .count())
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.slots {
            return Err(FsError::inconsistent(format!(
                "bitmap@{}: slot {index} out of range ({} slots)",
                self.start, self.slots
            )));
        }
        Ok(())
    }

    fn set(&self, blk_dev: &dyn BlockDevice, index: usize, value: u8) -> Result<()> {
        blk_dev.write_at(self.start + index as u64, &[value])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::FileDisk;

    fn scratch(slots: usize) -> (tempfile::TempDir, FileDisk, BitMap) {
        let dir = tempfile::tempdir().unwrap();
        let disk = FileDisk::create(&dir.path().join("bitmap.img"), 64 + slots as u64).unwrap();
        let map = BitMap::new(64, slots);
        map.format(&disk, 1).unwrap();
        (dir, disk, map)
    }

    #[test]
    fn first_fit_skips_reserved_slot() {
        let (_dir, disk, map) = scratch(8);
        assert_eq!(map.count_free(&disk).unwrap(), 7);
        assert_eq!(map.alloc(&disk).unwrap(), Some(1));
        assert_eq!(map.alloc(&disk).unwrap(), Some(2));
        map.dealloc(&disk, 1).unwrap();
        assert_eq!(map.alloc(&disk).unwrap(), Some(1));
        assert_eq!(map.count_free(&disk).unwrap(), 5);
    }

    #[test]
    fn exhaustion_yields_none() {
        let (_dir, disk, map) = scratch(3);
        assert_eq!(map.alloc(&disk).unwrap(), Some(1));
        assert_eq!(map.alloc(&disk).unwrap(), Some(2));
        assert_eq!(map.alloc(&disk).unwrap(), None);
        assert_eq!(map.count_free(&disk).unwrap(), 0);
    }

    #[test]
    fn double_free_and_out_of_range_are_rejected() {
        let (_dir, disk, map) = scratch(4);
        let before = map.load(&disk).unwrap();
        let err = map.dealloc(&disk, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalInconsistency);
        let err = map.dealloc(&disk, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalInconsistency);
        assert_eq!(map.load(&disk).unwrap(), before);
    }

    #[test]
    fn mark_used_repairs_a_slot() {
        let (_dir, disk, map) = scratch(4);
        map.mark_used(&disk, 3).unwrap();
        assert!(!map.is_free(&disk, 3).unwrap());
        assert_eq!(map.alloc(&disk).unwrap(), Some(1));
    }
}
