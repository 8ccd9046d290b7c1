use crate::net::support::{ErrorType, NetError, NetResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::NaiveDateTime;
use std::io;
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

/// Typed little-endian writer over a byte buffer. The buffer is either
/// growable (for payloads of unknown size) or fixed (for packets that
/// declare their serialized size in advance); a fixed writer fails with
/// `Capacity` instead of growing.
pub struct ByteWriter {
    data: Vec<u8>,
    limit: Option<usize>,
}

impl ByteWriter {
    /// A writer that grows on demand, starting from the supplied capacity.
    #[inline]
    pub fn growable(initial: usize) -> ByteWriter {
        ByteWriter {
            data: Vec::with_capacity(initial),
            limit: None,
        }
    }

    /// A writer capped at exactly `capacity` bytes.
    #[inline]
    pub fn fixed(capacity: usize) -> ByteWriter {
        ByteWriter {
            data: Vec::with_capacity(capacity),
            limit: Some(capacity),
        }
    }

    /// The number of bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Finalize the writer, yielding the read-ready buffer.
    #[inline]
    pub fn finish(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    fn ensure(&self, count: usize) -> NetResult<()> {
        match self.limit {
            Some(limit) if self.data.len() + count > limit => {
                Err(NetError::Fatal(ErrorType::Capacity))
            }
            _ => Ok(()),
        }
    }

    #[inline]
    pub fn write_byte(&mut self, value: u8) -> NetResult<()> {
        self.ensure(1)?;
        self.data.write_u8(value)?;
        Ok(())
    }

    #[inline]
    pub fn write_boolean(&mut self, value: bool) -> NetResult<()> {
        self.write_byte(value as u8)
    }

    /// Pack up to eight flags into a single byte, LSB first. Returns false
    /// in case the flag slice was truncated to fit.
    pub fn write_flags(&mut self, flags: &[bool]) -> NetResult<bool> {
        let mut packed = 0u8;

        for (bit, &flag) in flags.iter().take(8).enumerate() {
            if flag {
                packed |= 1 << bit;
            }
        }

        self.write_byte(packed)?;
        Ok(flags.len() <= 8)
    }

    #[inline]
    pub fn write_short(&mut self, value: i16) -> NetResult<()> {
        self.ensure(2)?;
        self.data.write_i16::<LittleEndian>(value)?;
        Ok(())
    }

    #[inline]
    pub fn write_int(&mut self, value: i32) -> NetResult<()> {
        self.ensure(4)?;
        self.data.write_i32::<LittleEndian>(value)?;
        Ok(())
    }

    #[inline]
    pub fn write_long(&mut self, value: i64) -> NetResult<()> {
        self.ensure(8)?;
        self.data.write_i64::<LittleEndian>(value)?;
        Ok(())
    }

    #[inline]
    pub fn write_float(&mut self, value: f32) -> NetResult<()> {
        self.ensure(4)?;
        self.data.write_u32::<LittleEndian>(value.to_bits())?;
        Ok(())
    }

    #[inline]
    pub fn write_double(&mut self, value: f64) -> NetResult<()> {
        self.ensure(8)?;
        self.data.write_u64::<LittleEndian>(value.to_bits())?;
        Ok(())
    }

    /// Raw bytes, no length prefix.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) -> NetResult<()> {
        self.ensure(bytes.len())?;
        self.data.write_all(bytes)?;
        Ok(())
    }

    /// A 4-byte length prefix followed by the raw bytes.
    #[inline]
    pub fn write_blob(&mut self, bytes: &[u8]) -> NetResult<()> {
        self.write_int(bytes.len() as i32)?;
        self.write_bytes(bytes)
    }

    /// Raw UTF-8 bytes, no length prefix. The reader must know the size.
    #[inline]
    pub fn write_string(&mut self, value: &str) -> NetResult<()> {
        self.write_bytes(value.as_bytes())
    }

    /// A 4-byte UTF-8 byte-count prefix followed by the bytes.
    #[inline]
    pub fn write_string_with_length(&mut self, value: &str) -> NetResult<()> {
        self.write_blob(value.as_bytes())
    }

    /// A 1-byte unsigned UTF-8 byte-count prefix followed by the bytes.
    /// Strings longer than 255 bytes are truncated at the last character
    /// boundary that fits.
    pub fn write_short_string_with_length(&mut self, value: &str) -> NetResult<()> {
        let mut cut = value.len().min(255);

        while !value.is_char_boundary(cut) {
            cut -= 1;
        }

        self.write_byte(cut as u8)?;
        self.write_bytes(&value.as_bytes()[..cut])
    }

    /// Two 8-byte little-endian longs, most significant first.
    #[inline]
    pub fn write_uuid(&mut self, value: &Uuid) -> NetResult<()> {
        let (high, low) = value.as_u64_pair();
        self.ensure(16)?;
        self.data.write_u64::<LittleEndian>(high)?;
        self.data.write_u64::<LittleEndian>(low)?;
        Ok(())
    }

    /// Formats the timestamp with the supplied chrono format string and
    /// carries it as a short length-prefixed string.
    #[inline]
    pub fn write_time(&mut self, value: &NaiveDateTime, format: &str) -> NetResult<()> {
        self.write_short_string_with_length(&value.format(format).to_string())
    }

    /// An externally-defined serde object, carried as a length-prefixed
    /// bincode blob.
    pub fn write_object<T: serde::Serialize>(&mut self, value: &T) -> NetResult<()> {
        let bytes =
            bincode::serialize(value).map_err(|_| NetError::Fatal(ErrorType::Serialization))?;
        self.write_blob(&bytes)
    }
}

/// Typed little-endian reader over a borrowed byte slice. All reads mirror
/// `ByteWriter` exactly.
pub struct ByteReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ByteReader<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader {
            cursor: Cursor::new(data),
        }
    }

    /// The number of unread bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    /// Returns true in case at least `count` bytes remain.
    #[inline]
    pub fn can_read(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// The current read offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    #[inline]
    pub fn read_byte(&mut self) -> NetResult<u8> {
        Ok(self.cursor.read_u8()?)
    }

    /// Any non-zero byte decodes as true.
    #[inline]
    pub fn read_boolean(&mut self) -> NetResult<bool> {
        Ok(self.read_byte()? != 0)
    }

    /// Unpacks one flag byte into eight booleans, LSB first.
    pub fn read_flags(&mut self) -> NetResult<[bool; 8]> {
        let packed = self.read_byte()?;
        let mut flags = [false; 8];

        for (bit, flag) in flags.iter_mut().enumerate() {
            *flag = packed & (1 << bit) != 0;
        }

        Ok(flags)
    }

    #[inline]
    pub fn read_short(&mut self) -> NetResult<i16> {
        Ok(self.cursor.read_i16::<LittleEndian>()?)
    }

    #[inline]
    pub fn read_int(&mut self) -> NetResult<i32> {
        Ok(self.cursor.read_i32::<LittleEndian>()?)
    }

    #[inline]
    pub fn read_long(&mut self) -> NetResult<i64> {
        Ok(self.cursor.read_i64::<LittleEndian>()?)
    }

    #[inline]
    pub fn read_float(&mut self) -> NetResult<f32> {
        Ok(f32::from_bits(self.cursor.read_u32::<LittleEndian>()?))
    }

    #[inline]
    pub fn read_double(&mut self) -> NetResult<f64> {
        Ok(f64::from_bits(self.cursor.read_u64::<LittleEndian>()?))
    }

    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> NetResult<Vec<u8>> {
        let mut bytes = vec![0; count];
        self.cursor.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    #[inline]
    pub fn read_blob(&mut self) -> NetResult<Vec<u8>> {
        let count = self.read_int()?;

        if count < 0 {
            return Err(NetError::Fatal(ErrorType::Serialization));
        }

        self.read_bytes(count as usize)
    }

    #[inline]
    pub fn read_string(&mut self, byte_count: usize) -> NetResult<String> {
        let bytes = self.read_bytes(byte_count)?;
        String::from_utf8(bytes).map_err(|_| NetError::Fatal(ErrorType::Serialization))
    }

    #[inline]
    pub fn read_string_with_length(&mut self) -> NetResult<String> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes).map_err(|_| NetError::Fatal(ErrorType::Serialization))
    }

    #[inline]
    pub fn read_short_string_with_length(&mut self) -> NetResult<String> {
        let count = self.read_byte()? as usize;
        self.read_string(count)
    }

    #[inline]
    pub fn read_uuid(&mut self) -> NetResult<Uuid> {
        let high = self.cursor.read_u64::<LittleEndian>()?;
        let low = self.cursor.read_u64::<LittleEndian>()?;
        Ok(Uuid::from_u64_pair(high, low))
    }

    #[inline]
    pub fn read_time(&mut self, format: &str) -> NetResult<NaiveDateTime> {
        let text = self.read_short_string_with_length()?;
        NaiveDateTime::parse_from_str(&text, format)
            .map_err(|_| NetError::Fatal(ErrorType::Serialization))
    }

    /// Reads an externally-defined serde object. Any failure yields `None`
    /// without propagating an error; the cursor still consumes the blob.
    pub fn read_object<T: serde::de::DeserializeOwned>(&mut self) -> Option<T> {
        let bytes = self.read_blob().ok()?;
        bincode::deserialize(&bytes).ok()
    }
}

impl<'a> io::Read for ByteReader<'a> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_derive::{Deserialize, Serialize};

    #[test]
    fn test_int_little_endian_layout() {
        let mut writer = ByteWriter::growable(8);
        writer.write_int(0x1122_3344).unwrap();

        assert_eq!(writer.finish(), vec![0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_primitive_roundtrip() {
        let mut writer = ByteWriter::growable(64);
        writer.write_byte(0xfe).unwrap();
        writer.write_boolean(true).unwrap();
        writer.write_short(-1234).unwrap();
        writer.write_int(-55_667_788).unwrap();
        writer.write_long(0x0102_0304_0506_0708).unwrap();
        writer.write_float(1.5).unwrap();
        writer.write_double(-2.25).unwrap();

        let data = writer.finish();
        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.read_byte().unwrap(), 0xfe);
        assert!(reader.read_boolean().unwrap());
        assert_eq!(reader.read_short().unwrap(), -1234);
        assert_eq!(reader.read_int().unwrap(), -55_667_788);
        assert_eq!(reader.read_long().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.read_float().unwrap(), 1.5);
        assert_eq!(reader.read_double().unwrap(), -2.25);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_float_bit_exact() {
        let mut writer = ByteWriter::growable(8);
        writer.write_float(f32::NAN).unwrap();
        writer.write_float(-0.0).unwrap();

        let data = writer.finish();
        let mut reader = ByteReader::new(&data);

        assert!(reader.read_float().unwrap().is_nan());
        assert_eq!(reader.read_float().unwrap().to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn test_flags_lsb_first() {
        let mut writer = ByteWriter::growable(4);
        let complete = writer
            .write_flags(&[true, false, false, true, false, false, false, true])
            .unwrap();

        assert!(complete);

        let data = writer.finish();
        assert_eq!(data, vec![0b1000_1001]);

        let mut reader = ByteReader::new(&data);
        let flags = reader.read_flags().unwrap();

        assert_eq!(flags, [true, false, false, true, false, false, false, true]);
    }

    #[test]
    fn test_flags_truncation_signalled() {
        let mut writer = ByteWriter::growable(4);
        let complete = writer.write_flags(&[true; 9]).unwrap();

        assert!(!complete);
        assert_eq!(writer.finish(), vec![0xff]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut writer = ByteWriter::growable(64);
        writer.write_string_with_length("hëllo wörld").unwrap();
        writer.write_short_string_with_length("tail").unwrap();

        let data = writer.finish();
        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.read_string_with_length().unwrap(), "hëllo wörld");
        assert_eq!(reader.read_short_string_with_length().unwrap(), "tail");
    }

    #[test]
    fn test_string_length_counts_bytes() {
        let mut writer = ByteWriter::growable(16);
        // Two characters, three UTF-8 bytes.
        writer.write_string_with_length("aé").unwrap();

        let data = writer.finish();
        assert_eq!(data[0], 3);
        assert_eq!(data.len(), 4 + 3);
    }

    #[test]
    fn test_short_string_truncates_on_char_boundary() {
        // 254 ascii bytes followed by a two-byte character; a naive cut at
        // 255 would split the character.
        let mut text = "x".repeat(254);
        text.push('é');

        let mut writer = ByteWriter::growable(300);
        writer.write_short_string_with_length(&text).unwrap();

        let data = writer.finish();
        assert_eq!(data[0], 254);

        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_short_string_with_length().unwrap(), "x".repeat(254));
    }

    #[test]
    fn test_uuid_roundtrip() {
        let id = Uuid::new_v4();

        let mut writer = ByteWriter::growable(16);
        writer.write_uuid(&id).unwrap();

        let data = writer.finish();
        assert_eq!(data.len(), 16);

        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_uuid().unwrap(), id);
    }

    #[test]
    fn test_time_roundtrip() {
        let time = NaiveDate::from_ymd_opt(2019, 4, 12)
            .unwrap()
            .and_hms_opt(16, 20, 42)
            .unwrap();

        let mut writer = ByteWriter::growable(32);
        writer.write_time(&time, "%Y-%m-%d %H:%M:%S").unwrap();

        let data = writer.finish();
        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.read_time("%Y-%m-%d %H:%M:%S").unwrap(), time);
    }

    #[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
    struct Marker {
        id: u32,
        label: String,
    }

    #[test]
    fn test_object_roundtrip() {
        let marker = Marker {
            id: 77,
            label: "beacon".to_string(),
        };

        let mut writer = ByteWriter::growable(64);
        writer.write_object(&marker).unwrap();

        let data = writer.finish();
        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.read_object::<Marker>(), Some(marker));
    }

    #[test]
    fn test_object_failure_yields_none() {
        let mut reader = ByteReader::new(&[1, 0, 0, 0, 0xff]);

        assert_eq!(reader.read_object::<Marker>(), None);
    }

    #[test]
    fn test_fixed_capacity_exceeded() {
        let mut writer = ByteWriter::fixed(2);

        writer.write_short(1).unwrap();
        let result = writer.write_byte(2);

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorType::Capacity));
        assert_eq!(writer.len(), 2);
    }

    #[test]
    fn test_reader_bounds() {
        let data = [1u8, 2, 3];
        let mut reader = ByteReader::new(&data);

        assert!(reader.can_read(3));
        assert!(!reader.can_read(4));

        reader.read_byte().unwrap();
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.position(), 1);

        assert!(reader.read_int().is_err());
    }
}
