/// Read-only 4-bit-per-cell lookup over a cuboid with fixed X/Z depth.
///
/// Cells are addressed as `x << (depth_bits + 4) | z << depth_bits | y`, two
/// cells per byte: even indices live in the low nibble, odd ones in the high
/// nibble. This is the layout of pre-Anvil light and block-data planes, where
/// `depth_bits` is 7 (128-block-tall columns).
///
/// No bounds are checked beyond the backing slice: coordinates outside the
/// cuboid alias other cells.
#[derive(Clone, Debug)]
pub struct NibbleArray<B = Vec<u8>> {
    data: B,
    depth_bits: u32,
    depth_bits_plus_four: u32,
}

impl<B: AsRef<[u8]>> NibbleArray<B> {
    pub fn new(data: B, depth_bits: u32) -> Self {
        Self {
            data,
            depth_bits,
            depth_bits_plus_four: depth_bits + 4,
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> u8 {
        let index = (x << self.depth_bits_plus_four) | (z << self.depth_bits) | y;
        let byte = self.data.as_ref()[(index >> 1) as usize];
        if index & 1 == 0 { byte & 0xF } else { byte >> 4 }
    }

    pub fn depth_bits(&self) -> u32 {
        self.depth_bits
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }
}
