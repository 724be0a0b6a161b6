use bytes::{Bytes, BytesMut};

use petfeeder_shared::constants::NAL_SEPARATOR;

/// Incremental H.264 Annex-B splitter.
///
/// Each emitted unit starts with its `00 00 00 01` start code, so units can
/// be fed to a decoder as-is. Bytes preceding the first start code are
/// emitted as a unit of their own.
#[derive(Debug, Default)]
pub struct NalSplitter {
    buf: BytesMut,
    /// Offset up to which `buf` is known to hold no separator (past index 0).
    scanned: usize,
}

impl NalSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every unit it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut units = Vec::new();
        while let Some(boundary) = self.next_boundary() {
            units.push(self.buf.split_to(boundary).freeze());
            self.scanned = 0;
        }
        units
    }

    /// Return whatever is buffered as the final unit.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    fn next_boundary(&mut self) -> Option<usize> {
        let start = self.scanned.max(1);
        if self.buf.len() < start + NAL_SEPARATOR.len() {
            return None;
        }

        match self.buf[start..]
            .windows(NAL_SEPARATOR.len())
            .position(|w| w == NAL_SEPARATOR)
        {
            Some(offset) => Some(start + offset),
            None => {
                // A separator may straddle the next chunk.
                self.scanned = self.buf.len() + 1 - NAL_SEPARATOR.len();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEP: [u8; 4] = NAL_SEPARATOR;

    fn unit(body: &[u8]) -> Vec<u8> {
        let mut v = SEP.to_vec();
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn splits_complete_units() {
        let mut splitter = NalSplitter::new();
        let mut input = unit(&[0x67, 1, 2]);
        input.extend(unit(&[0x68, 3]));
        input.extend(unit(&[0x65, 4, 5, 6]));

        let units = splitter.push(&input);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &unit(&[0x67, 1, 2])[..]);
        assert_eq!(&units[1][..], &unit(&[0x68, 3])[..]);

        let last = splitter.flush().unwrap();
        assert_eq!(&last[..], &unit(&[0x65, 4, 5, 6])[..]);
        assert!(splitter.flush().is_none());
    }

    #[test]
    fn separator_across_chunks() {
        let mut splitter = NalSplitter::new();
        let mut input = unit(&[0x41, 9, 9]);
        input.extend(unit(&[0x41, 7]));

        // Cut inside the second start code.
        let (a, b) = input.split_at(5);
        assert!(splitter.push(a).is_empty());
        let units = splitter.push(b);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &unit(&[0x41, 9, 9])[..]);
        assert_eq!(&splitter.flush().unwrap()[..], &unit(&[0x41, 7])[..]);
    }

    #[test]
    fn byte_by_byte() {
        let mut splitter = NalSplitter::new();
        let mut input = unit(&[1]);
        input.extend(unit(&[2, 2]));
        input.extend(unit(&[3]));

        let mut units = Vec::new();
        for b in &input {
            units.extend(splitter.push(std::slice::from_ref(b)));
        }
        units.extend(splitter.flush());

        assert_eq!(units.len(), 3);
        let joined: Vec<u8> = units.iter().flat_map(|u| u.iter().copied()).collect();
        assert_eq!(joined, input);
    }

    #[test]
    fn leading_garbage_is_its_own_unit() {
        let mut splitter = NalSplitter::new();
        let mut input = vec![0xAA, 0xBB];
        input.extend(unit(&[5]));

        let units = splitter.push(&input);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &[0xAA, 0xBB]);
    }
}
