#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIdx(pub(crate) u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// One bit per piece, most significant bit first within each byte.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct PieceBitfield {
    data: Vec<u8>,
    size: u32,
}

impl PieceBitfield {
    // size is the number of bits required
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_bytes(size)];
        Self { data, size }
    }

    /// Returns `None` if `bytes` is not exactly `required_bytes(size)` long.
    pub fn from_bytes(bytes: &[u8], size: u32) -> Option<Self> {
        if bytes.len() != Self::required_bytes(size) {
            return None;
        }
        let mut bitfield = Self {
            data: bytes.to_vec(),
            size,
        };
        bitfield.clear_padding();
        Some(bitfield)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn has_piece(&self, index: PieceIdx) -> bool {
        if index.0 >= self.size {
            return false;
        }
        let (byte_index, bit_index) = Self::indices(index.0);
        (self.data[byte_index] & (1 << bit_index)) > 0
    }

    pub fn set_piece(&mut self, index: PieceIdx) {
        let (byte_index, bit_index) = self.checked_indices(index);
        self.data[byte_index] |= 1 << bit_index;
    }

    pub fn num_set(&self) -> u32 {
        self.pieces().count() as u32
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.as_ref()
    }

    /// Iterator over pieces that this bitfield contains
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .map(PieceIdx::new)
            .filter(move |p| self.has_piece(*p))
    }

    /// Number of bytes needed to hold `num_bits` bits.
    pub fn required_bytes(num_bits: u32) -> usize {
        num_bits.div_ceil(8) as usize
    }

    fn clear_padding(&mut self) {
        let used = self.size % 8;
        if used != 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= 0xFFu8 << (8 - used);
            }
        }
    }

    // panics if index is outside the bitfield
    fn checked_indices(&self, index: PieceIdx) -> (usize, usize) {
        if index.0 >= self.size {
            panic!("bitfield of {} bits has no index {}", self.size, index.0);
        }
        Self::indices(index.0)
    }

    // returns (byte_index, bit_index)
    fn indices(index: u32) -> (usize, usize) {
        let byte_index = index as usize / 8;
        let bit_index = 7 - index as usize % 8;
        (byte_index, bit_index)
    }
}

impl std::fmt::Debug for PieceBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceBitfield")
            .field("bits", &self.size)
            .field("set", &self.num_set())
            .finish()
    }
}

impl AsRef<[u8]> for PieceBitfield {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn creation() {
        let bf = PieceBitfield::with_size(33);
        assert_eq!(bf.bytes().len(), 5);
        assert_eq!(PieceBitfield::with_size(0).bytes().len(), 0);
        assert_eq!(PieceBitfield::with_size(8).bytes().len(), 1);
        assert_eq!(PieceBitfield::with_size(9).bytes().len(), 2);
    }

    #[test]
    fn msb_first() {
        let mut bf = PieceBitfield::with_size(10);
        bf.set_piece(PieceIdx::new(0));
        bf.set_piece(PieceIdx::new(7));
        bf.set_piece(PieceIdx::new(8));
        let bits = bf
            .bytes()
            .iter()
            .map(|b| format!("{b:08b}"))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(bits, "10000001 10000000");
    }

    #[test]
    fn setting_bits() {
        let mut bf = PieceBitfield::with_size(32);
        bf.set_piece(PieceIdx::new(5));
        bf.set_piece(PieceIdx::new(9));
        bf.set_piece(PieceIdx::new(30));

        for i in 0..32 {
            let expected = i == 5 || i == 9 || i == 30;
            assert_eq!(bf.has_piece(PieceIdx::new(i)), expected);
        }
        assert_eq!(bf.num_set(), 3);
    }

    #[test]
    fn from_bytes_checks_length_and_padding() {
        assert!(PieceBitfield::from_bytes(&[0xFF], 9).is_none());
        assert!(PieceBitfield::from_bytes(&[0xFF, 0xFF, 0x00], 9).is_none());

        let bf = PieceBitfield::from_bytes(&[0xFF, 0xFF], 9).unwrap();
        assert_eq!(bf.bytes(), &[0xFF, 0x80]);
        assert_eq!(bf.num_set(), 9);
        assert!(!bf.has_piece(PieceIdx::new(9)));
    }

    #[test]
    #[should_panic]
    fn set_out_of_range() {
        let mut bf = PieceBitfield::with_size(3);
        bf.set_piece(PieceIdx::new(3));
    }
}
