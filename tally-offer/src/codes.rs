use rand::Rng;
use std::collections::HashSet;

/// Uppercase letters and digits without the look-alikes 0, O, 1 and I.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 12;

/// Generates redemption codes for voucher batches.
#[derive(Debug, Clone, Copy)]
pub struct CodeGenerator {
    length: usize,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self { length: CODE_LENGTH }
    }
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        (0..self.length)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }

    /// `count` codes, distinct within the batch. Collisions with codes
    /// already stored are caught by the store's unique index.
    pub fn batch(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let mut seen = HashSet::with_capacity(count);
        let mut codes = Vec::with_capacity(count);
        while codes.len() < count {
            let code = self.code(&mut rng);
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_codes_use_unambiguous_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        let generator = CodeGenerator::new();
        for _ in 0..200 {
            let code = generator.code(&mut rng);
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(!code.contains(&['0', 'O', '1', 'I'][..]));
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_batch_is_distinct() {
        let codes = CodeGenerator::new().batch(500);
        let unique: HashSet<&String> = codes.iter().collect();
        assert_eq!(unique.len(), 500);
    }
}
