use std::io;

/// A dynamically sized buffered FIFO byte queue. Data is appended at the
/// tail and read from the head. Storage grows in multiples of the increment
/// supplied at construction and never shrinks while data is in flight.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    increment: usize,
}

impl Buffer {
    #[inline]
    pub fn new(increment: usize) -> Buffer {
        if increment == 0 {
            panic!("Buffer increment must be non-zero");
        }

        Buffer {
            data: vec![0; increment],
            head: 0,
            tail: 0,
            increment,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity at the tail.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.tail
    }

    /// Total storage currently held.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Advance the head, consuming data. Resets the cursors once all data
    /// has been read so the storage is reused from the front.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(self.head + count <= self.tail);
        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Advance the tail, committing data written through `write_slice`.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.tail + count <= self.data.len());
        self.tail += count;
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Slice containing free capacity to be written. Writes must be
    /// committed with `move_tail`.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Append the supplied bytes, growing the storage as needed.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
    }

    /// Ensure at least `count` bytes of free capacity at the tail, first by
    /// compacting consumed head space, then by growing in increments.
    pub fn reserve(&mut self, count: usize) {
        if self.free_capacity() >= count {
            return;
        }

        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }

        while self.data.len() - self.tail < count {
            let grown = self.data.len() + self.increment;
            self.data.resize(grown, 0);
        }
    }

    /// Write the contents of the buffer to the supplied writer, advancing
    /// the read offset. Bytes accepted by the writer are consumed even when
    /// a subsequent write fails.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.len();

        while !self.is_empty() {
            let write_count = writer.write(&self.data[self.head..self.tail])?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.len())
    }

    /// Read in data from the supplied reader to the buffer, growing as
    /// needed up to `limit` total bytes held.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R, limit: usize) -> io::Result<usize> {
        let mut received = 0;

        loop {
            if self.len() >= limit {
                return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
            }

            if self.free_capacity() == 0 {
                self.reserve(self.increment);
            }

            let read_count = reader.read(&mut self.data[self.tail..])?;

            if read_count == 0 {
                return Ok(received);
            }

            self.move_tail(read_count);
            received += read_count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..2048).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(4096);

        let result = buffer.ingress(&mut channel, 4096);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(64);

        // The buffer has to have at least some data to trigger the zero write error
        buffer.extend(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_limit_overrun() {
        let mock_data: Vec<_> = (0..512).map(|item| item as u8).collect();

        let mut buffer = Buffer::new(64);

        let result = buffer.ingress(&mock_data[..], 256);

        assert!(result.is_err());

        let err = result.err().unwrap();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(err.to_string(), "Buffer overrun")
    }

    #[test]
    fn test_no_err() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(64);

        buffer.ingress(&mut cursor, 64).unwrap();

        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut cursor = Cursor::new(Vec::<u8>::new());

        buffer.egress(&mut cursor).unwrap();

        assert_eq!(buffer.read_slice(), &Vec::<u8>::new()[..]);

        assert_eq!(&cursor.get_ref()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_growth_in_increments() {
        let mut buffer = Buffer::new(16);

        buffer.extend(&[7; 40]);

        assert_eq!(buffer.len(), 40);
        assert_eq!(buffer.capacity() % 16, 0);
        assert!(buffer.capacity() >= 40);
    }

    #[test]
    fn test_compaction_reuses_consumed_space() {
        let mut buffer = Buffer::new(16);

        buffer.extend(&[1; 12]);
        buffer.move_head(8);
        buffer.extend(&[2; 10]);

        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.len(), 14);
        assert_eq!(&buffer.read_slice()[..4], &[1, 1, 1, 1]);
        assert_eq!(&buffer.read_slice()[4..], &[2; 10]);
    }

    #[test]
    #[should_panic(expected = "Buffer increment must be non-zero")]
    fn test_fail_on_zero_increment() {
        let _ = Buffer::new(0);
    }
}
