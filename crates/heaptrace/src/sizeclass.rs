//! The runtime's small-object size-class tables.
//!
//! Small allocations are rounded up to one of 66 fixed element sizes, each
//! carved from spans of a fixed page count. Class 0 is reserved for large
//! (one-object-per-span) allocations. A *span class* folds the
//! pointer-free ("noscan") bit into the low bit: `size_class * 2 + noscan`.
//!
//! The trace encodes class allocations against span classes, so both the
//! parser and the segregated-fit simulator share these tables.

/// Number of size classes, including the reserved class 0.
pub const NUM_SIZE_CLASSES: usize = 67;

/// Number of span classes: every size class in a scan and a noscan flavor.
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES * 2;

/// Largest size in bytes served from a size class.
pub const MAX_SMALL_SIZE: u64 = 32 << 10;

/// Element size in bytes for each size class.
pub const CLASS_TO_SIZE: [u64; NUM_SIZE_CLASSES] = [
    0, 8, 16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320, 352,
    384, 416, 448, 480, 512, 576, 640, 704, 768, 896, 1024, 1152, 1280, 1408, 1536, 1792, 2048,
    2304, 2688, 3072, 3200, 3456, 4096, 4864, 5376, 6144, 6528, 6784, 6912, 8192, 9472, 9728,
    10240, 10880, 12288, 13568, 14336, 16384, 18432, 19072, 20480, 21760, 24576, 27264, 28672,
    32768,
];

/// Span length in 8 KiB pages for each size class.
pub const CLASS_TO_PAGES: [u64; NUM_SIZE_CLASSES] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 2, 1, 2, 1, 2, 1, 3, 2, 3, 1, 3, 2, 3, 4, 5, 6, 1, 7, 6, 5, 4, 3, 5, 7, 2, 9, 7, 5,
    8, 3, 10, 7, 4,
];

/// A size class with the pointer-free ("noscan") bit folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanClass(pub u8);

impl SpanClass {
    /// Build a span class from a size class and the noscan bit.
    #[must_use]
    pub const fn new(size_class: u8, noscan: bool) -> Self {
        Self(size_class << 1 | noscan as u8)
    }

    /// The underlying size class.
    #[must_use]
    pub const fn size_class(self) -> u8 {
        self.0 >> 1
    }

    /// Whether objects of this class are guaranteed pointer-free.
    #[must_use]
    pub const fn noscan(self) -> bool {
        self.0 & 1 != 0
    }

    /// Index into per-span-class tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The smallest size class whose elements hold `size` bytes.
///
/// # Panics
///
/// Panics if `size` exceeds [`MAX_SMALL_SIZE`]; larger objects get a span
/// of their own and bypass the class tables.
#[must_use]
pub fn size_to_class(size: u64) -> u8 {
    assert!(size <= MAX_SMALL_SIZE, "no size class holds {size} bytes");
    let class = CLASS_TO_SIZE[1..].partition_point(|&s| s < size) + 1;
    class as u8
}

/// Element size for a span class as encoded in the trace, or `None` for a
/// span class outside the table.
#[must_use]
pub const fn span_class_to_size(span_class: u8) -> Option<u64> {
    let size_class = (span_class >> 1) as usize;
    if size_class < NUM_SIZE_CLASSES {
        Some(CLASS_TO_SIZE[size_class])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_line_up() {
        assert_eq!(CLASS_TO_SIZE.len(), NUM_SIZE_CLASSES);
        assert_eq!(CLASS_TO_PAGES.len(), NUM_SIZE_CLASSES);
        assert_eq!(CLASS_TO_SIZE[NUM_SIZE_CLASSES - 1], MAX_SMALL_SIZE);
        // Sizes strictly increase and stay 8-byte aligned past class 1.
        for class in 2..NUM_SIZE_CLASSES {
            assert!(CLASS_TO_SIZE[class] > CLASS_TO_SIZE[class - 1]);
            assert_eq!(CLASS_TO_SIZE[class] % 8, 0);
        }
        // Every span holds at least one element.
        for class in 1..NUM_SIZE_CLASSES {
            assert!(CLASS_TO_PAGES[class] * 8192 >= CLASS_TO_SIZE[class]);
        }
    }

    #[test]
    fn test_size_to_class() {
        assert_eq!(size_to_class(0), 1);
        assert_eq!(size_to_class(1), 1);
        assert_eq!(size_to_class(8), 1);
        assert_eq!(size_to_class(9), 2);
        assert_eq!(size_to_class(1024), 31);
        assert_eq!(size_to_class(1025), 32);
        assert_eq!(size_to_class(MAX_SMALL_SIZE), 66);
        // The chosen class always fits the request; the one below never does.
        for size in (1..=MAX_SMALL_SIZE).step_by(61) {
            let class = size_to_class(size) as usize;
            assert!(CLASS_TO_SIZE[class] >= size);
            if class > 1 {
                assert!(CLASS_TO_SIZE[class - 1] < size);
            }
        }
    }

    #[test]
    fn test_span_classes() {
        let spc = SpanClass::new(3, true);
        assert_eq!(spc.0, 7);
        assert_eq!(spc.size_class(), 3);
        assert!(spc.noscan());
        assert_eq!(span_class_to_size(7), Some(32));
        assert_eq!(span_class_to_size(6), Some(32));
        assert_eq!(span_class_to_size(2), Some(8));
        assert_eq!(span_class_to_size(200), None);
    }
}
