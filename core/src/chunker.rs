use fastcdc::v2020::FastCDC;

/// Content-defined chunker. Boundaries depend only on the data, so unchanged
/// regions of an edited file produce the same chunks again.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl Chunker {
    /// `avg_size` is clamped to what FastCDC accepts (256 B to 4 MiB).
    pub fn new(avg_size: u32) -> Self {
        let avg_size = avg_size.clamp(256, 4 * 1024 * 1024);
        Self {
            min_size: avg_size / 4,
            avg_size,
            max_size: avg_size * 4,
        }
    }

    /// Split `data` into consecutive slices. Empty input yields nothing.
    pub fn chunks<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        let cuts: Vec<(usize, usize)> = if data.is_empty() {
            Vec::new()
        } else {
            FastCDC::new(data, self.min_size, self.avg_size, self.max_size)
                .map(|cut| (cut.offset, cut.length))
                .collect()
        };
        cuts.into_iter()
            .map(move |(offset, length)| &data[offset..offset + length])
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_cover_input() {
        let chunker = Chunker::new(1024);
        let data: Vec<u8> = (0..10000u32).map(|i| (i * 7 % 251) as u8).collect();
        let chunks: Vec<&[u8]> = chunker.chunks(&data).collect();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_edit_keeps_later_boundaries() {
        let chunker = Chunker::new(256);
        let mut data: Vec<u8> = (0..20000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let before: Vec<Vec<u8>> = chunker.chunks(&data).map(<[u8]>::to_vec).collect();
        data[10] ^= 0xff;
        let after: Vec<Vec<u8>> = chunker.chunks(&data).map(<[u8]>::to_vec).collect();

        assert_eq!(before.last(), after.last());
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        assert_eq!(Chunker::default().chunks(&[]).count(), 0);
        assert_eq!(Chunker::new(1).avg_size, 256);
    }
}
