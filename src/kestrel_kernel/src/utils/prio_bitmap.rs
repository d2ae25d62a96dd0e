//! Provides `TwoLevelBitmap`, a bit array structure supporting
//! constant-time bit scan operations.
use core::fmt;

use super::Init;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

/// Trait for [`TwoLevelBitmap`].
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first set bit.
    fn find_set(&self) -> Option<usize>;
}

/// Stores `LEN` (≤ `WORDS * WORD_LEN`, `WORDS` ≤ `WORD_LEN`) entries.
///
/// The first level is a single word summarizing which second-level words
/// are non-zero, so a bit scan takes two `trailing_zeros` operations.
#[derive(Clone, Copy)]
pub struct TwoLevelBitmap<const LEN: usize, const WORDS: usize> {
    // Invariant: `summary.get_bit(i) == (words[i] != 0)`
    summary: Word,
    words: [Word; WORDS],
}

impl<const LEN: usize, const WORDS: usize> Init for TwoLevelBitmap<LEN, WORDS> {
    const INIT: Self = Self {
        summary: 0,
        words: [0; WORDS],
    };
}

impl<const LEN: usize, const WORDS: usize> fmt::Debug for TwoLevelBitmap<LEN, WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize, const WORDS: usize> PrioBitmap for TwoLevelBitmap<LEN, WORDS> {
    fn get(&self, i: usize) -> bool {
        assert!(i < LEN);
        (self.words[i / WORD_LEN] >> (i % WORD_LEN)) & 1 != 0
    }

    fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        let word = &mut self.words[i / WORD_LEN];
        *word &= !(1 << (i % WORD_LEN));
        if *word == 0 {
            self.summary &= !(1 << (i / WORD_LEN));
        }
    }

    fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.words[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.summary |= 1 << (i / WORD_LEN);
    }

    fn find_set(&self) -> Option<usize> {
        let word_i = self.summary.trailing_zeros() as usize;
        if word_i == WORD_LEN {
            None
        } else {
            let bit_i = self.words[word_i].trailing_zeros() as usize;
            debug_assert_ne!(bit_i, WORD_LEN);
            Some(bit_i + word_i * WORD_LEN)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if bitmap_len == 0 {
                None
            } else if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &impl PrioBitmap, bitmap_len: usize) -> Vec<usize> {
        (0..bitmap_len).filter(|&i| bitmap.get(i)).collect()
    }

    fn test_inner<T: PrioBitmap>(bytecode: Vec<u8>, size: usize) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut subject = T::INIT;
        let mut reference = BTreePrioBitmap::new();

        log::info!("size = {size}");

        for cmd in interpret(&bytecode, size) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(enum_set_bits(&subject, size), reference.enum_set_bits());
    }

    macro_rules! gen_test {
        ($(#[$m:meta])* mod $name:ident, $size:literal, $words:literal) => {
            $(#[$m])*
            mod $name {
                use super::*;

                #[quickcheck]
                fn test(bytecode: Vec<u8>) {
                    test_inner::<TwoLevelBitmap<$size, $words>>(bytecode, $size);
                }
            }
        };
    }

    gen_test!(mod size_1, 1, 1);
    gen_test!(mod size_10, 10, 1);
    gen_test!(
        #[cfg(any(target_pointer_width = "64", target_pointer_width = "128"))]
        mod size_64, 64, 1
    );
    gen_test!(
        #[cfg(any(target_pointer_width = "64", target_pointer_width = "128"))]
        mod size_100, 100, 2
    );
    gen_test!(
        #[cfg(any(target_pointer_width = "64", target_pointer_width = "128"))]
        mod size_1000, 1000, 16
    );
}
