/// Incremental checksum used by WAL entries and checkpoint images.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far without consuming state.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Crc32Fast {
    /// Computes the CRC32 of several chunks as if they were contiguous.
    pub fn of(chunks: &[&[u8]]) -> u32 {
        let mut hasher = Self::default();
        for chunk in chunks {
            hasher.update(chunk);
        }
        hasher.finalize()
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn chunked_crc_matches_contiguous() {
        assert_eq!(
            Crc32Fast::of(&[b"ab", b"cd"]),
            Crc32Fast::of(&[b"abcd"])
        );
        assert_ne!(Crc32Fast::of(&[b"abcd"]), Crc32Fast::of(&[b"abce"]));
    }
}
