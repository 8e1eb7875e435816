//! Partitioning of a raster extent into square processing blocks.

/// A rectangular window of the raster, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Left column.
    pub x: u32,
    /// Top row.
    pub y: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

impl Block {
    /// Number of pixels in the block.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Row-major iterator over the blocks covering a `width` x `height` extent.
///
/// Blocks on the right and bottom edges are truncated to the extent.
#[derive(Debug, Clone)]
pub struct Blocks {
    width: u32,
    height: u32,
    size: u32,
    x: u32,
    y: u32,
}

impl Blocks {
    /// Blocks of at most `size` x `size` pixels. A zero size is treated as one.
    pub fn new(width: u32, height: u32, size: u32) -> Self {
        Self {
            width,
            height,
            size: size.max(1),
            x: 0,
            y: 0,
        }
    }

    /// Number of blocks in the extent.
    pub fn total(&self) -> usize {
        let across = self.width.div_ceil(self.size) as usize;
        let down = self.height.div_ceil(self.size) as usize;
        across * down
    }
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.width == 0 || self.y >= self.height {
            return None;
        }
        let block = Block {
            x: self.x,
            y: self.y,
            width: self.size.min(self.width - self.x),
            height: self.size.min(self.height - self.y),
        };
        self.x += self.size;
        if self.x >= self.width {
            self.x = 0;
            self.y += self.size;
        }
        Some(block)
    }
}
