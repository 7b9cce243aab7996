/// Canonical guest register image.
///
/// Compiled code reads and writes these fields directly through
/// `offset_of!`, so the layout is fixed.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuState {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
}

impl CpuState {
    pub fn new(pc: u32) -> Self {
        Self {
            pc,
            ..Default::default()
        }
    }

    pub fn reg(&self, r: usize) -> u32 {
        self.gpr[r]
    }

    /// Writes to `$zero` are discarded.
    pub fn set_reg(&mut self, r: usize, val: u32) {
        if r != 0 {
            self.gpr[r] = val;
        }
    }
}

pub const DEFAULT_MEM_SIZE: usize = 32 << 20;

/// Flat guest memory. Every guest address is masked into the array and
/// multi-byte accesses are force-aligned, so no access can fault.
pub struct Memory {
    data: Box<[u8]>,
    mask: u32,
}

impl Memory {
    pub fn new(size: usize) -> anyhow::Result<Self> {
        if !size.is_power_of_two() || size < 4 || size as u64 > 1 << 32 {
            anyhow::bail!("memory size must be a power of two: {size:#x}");
        }
        Ok(Self {
            data: vec![0; size].into_boxed_slice(),
            mask: (size - 1) as u32,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn base_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn load(&mut self, addr: u32, bin: &[u8]) -> anyhow::Result<()> {
        let start = (addr & self.mask) as usize;
        let end = start + bin.len();
        if end > self.data.len() {
            anyhow::bail!(
                "image of {} bytes does not fit at {addr:#010x} (memory size {:#x})",
                bin.len(),
                self.data.len()
            );
        }
        self.data[start..end].copy_from_slice(bin);
        Ok(())
    }

    fn offset(&self, addr: u32, align: u32) -> usize {
        (addr & self.mask & !(align - 1)) as usize
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.data[self.offset(addr, 1)]
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        let o = self.offset(addr, 2);
        u16::from_le_bytes([self.data[o], self.data[o + 1]])
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let o = self.offset(addr, 4);
        u32::from_le_bytes([
            self.data[o],
            self.data[o + 1],
            self.data[o + 2],
            self.data[o + 3],
        ])
    }

    pub fn write_u8(&mut self, addr: u32, val: u8) {
        let o = self.offset(addr, 1);
        self.data[o] = val;
    }

    pub fn write_u16(&mut self, addr: u32, val: u16) {
        let o = self.offset(addr, 2);
        self.data[o..o + 2].copy_from_slice(&val.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u32, val: u32) {
        let o = self.offset(addr, 4);
        self.data[o..o + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Reads a NUL-terminated string, stopping after `max` bytes.
    pub fn read_cstr(&self, addr: u32, max: usize) -> Vec<u8> {
        (0..max as u32)
            .map(|i| self.read_u8(addr.wrapping_add(i)))
            .take_while(|&b| b != 0)
            .collect()
    }

    /// Loads a program made of instruction words at `addr`.
    pub fn load_words(&mut self, addr: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.write_u32(addr.wrapping_add(i as u32 * 4), *w);
        }
    }
}
