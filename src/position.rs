// src/position.rs

/// Maps logical block numbers onto byte offsets inside the container.
///
/// The first `master_block_size` bytes hold the header; block `n` starts
/// at `master_block_size + n * block_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionCalculator {
    block_size: u64,
    master_block_size: u64,
}

impl PositionCalculator {
    pub fn new(block_size: u64, master_block_size: u64) -> Self {
        PositionCalculator { block_size, master_block_size }
    }

    #[inline(always)]
    pub fn offset(&self, block_number: u64) -> u64 {
        self.master_block_size + block_number * self.block_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn master_block_size(&self) -> u64 {
        self.master_block_size
    }

    /// Number of whole blocks that fit in a container of `len` bytes.
    pub fn blocks_in(&self, len: u64) -> u64 {
        len.saturating_sub(self.master_block_size) / self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_block_follows_header() {
        let calc = PositionCalculator::new(1024, 2048);
        assert_eq!(calc.offset(0), 2048);
        assert_eq!(calc.offset(5), 7168);
    }

    #[test]
    fn offsets_strictly_increase() {
        let calc = PositionCalculator::new(512, 4096);
        let mut previous = None;
        for n in 0..1000u64 {
            let offset = calc.offset(n);
            assert_eq!(offset, 4096 + n * 512);
            if let Some(p) = previous {
                assert!(offset > p);
            }
            previous = Some(offset);
        }
    }

    #[test]
    fn blocks_in_ignores_partial_tail() {
        let calc = PositionCalculator::new(1024, 2048);
        assert_eq!(calc.blocks_in(1000), 0);
        assert_eq!(calc.blocks_in(2048 + 3 * 1024 + 10), 3);
    }
}
