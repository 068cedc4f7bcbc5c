use usbd_msc::storage::{BlockDevice, Capacity, MediaError};

/// Single volume shared by every LUN, counting backend calls
pub struct RamDisk {
    pub data: Vec<u8>,
    pub block_size: u32,
    pub locked: bool,
    pub status: Result<(), MediaError>,
    pub reads: usize,
    pub writes: usize,
    pub unlocks: usize,
    /// Runs before every read, may block to hold the worker inside the data phase
    pub read_hook: Option<Box<dyn FnMut() + Send>>,
}

impl RamDisk {
    /// Every byte of a block holds the low byte of its LBA
    pub fn new(block_count: u64, block_size: u32) -> Self {
        let mut data = vec![0u8; block_count as usize * block_size as usize];
        for (lba, block) in data.chunks_mut(block_size as usize).enumerate() {
            block.fill(lba as u8);
        }
        Self {
            data,
            block_size,
            locked: false,
            status: Ok(()),
            reads: 0,
            writes: 0,
            unlocks: 0,
            read_hook: None,
        }
    }

    pub fn block(&self, lba: u64) -> &[u8] {
        let start = lba as usize * self.block_size as usize;
        &self.data[start..start + self.block_size as usize]
    }

    fn range(&self, lba: u64, blocks: u32) -> Result<std::ops::Range<usize>, MediaError> {
        let start = lba as usize * self.block_size as usize;
        let end = start + blocks as usize * self.block_size as usize;
        if end > self.data.len() {
            return Err(MediaError::Io);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn capacity(&mut self, _lun: u8) -> Result<Capacity, MediaError> {
        Ok(Capacity {
            block_count: (self.data.len() / self.block_size as usize) as u64,
            block_size: self.block_size,
        })
    }

    fn read(&mut self, _lun: u8, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<(), MediaError> {
        if let Some(hook) = self.read_hook.as_mut() {
            hook();
        }
        let range = self.range(lba, blocks)?;
        buf.copy_from_slice(&self.data[range]);
        self.reads += 1;
        Ok(())
    }

    fn write(&mut self, _lun: u8, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), MediaError> {
        let range = self.range(lba, blocks)?;
        self.data[range].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    fn status(&mut self, _lun: u8) -> Result<(), MediaError> {
        self.status
    }

    fn lock(&mut self, _lun: u8, _timeout_ms: u32) -> Result<(), MediaError> {
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self, _lun: u8) -> Result<(), MediaError> {
        self.locked = false;
        self.unlocks += 1;
        Ok(())
    }
}
