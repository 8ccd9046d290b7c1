use crate::net::support::{ErrorType, NetError, NetResult};
use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const OUT_CHUNK: usize = 4096;

/// Stateful raw-deflate compressor. The output carries a 4-byte
/// little-endian uncompressed-length prefix followed by the deflate bytes.
/// Not thread-safe; owners must not share one instance across threads.
pub struct Deflater {
    state: Compress,
}

impl Deflater {
    #[inline]
    pub fn new() -> Deflater {
        Deflater {
            state: Compress::new(Compression::default(), false),
        }
    }

    pub fn compress(&mut self, input: &[u8]) -> NetResult<Vec<u8>> {
        self.state.reset();

        let mut out = Vec::with_capacity(4 + input.len() / 2 + 16);
        out.resize(4, 0);
        LittleEndian::write_u32(&mut out[..4], input.len() as u32);

        loop {
            let consumed = self.state.total_in() as usize;

            if out.len() == out.capacity() {
                out.reserve(OUT_CHUNK);
            }

            let status = self
                .state
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Finish)
                .map_err(|_| NetError::Fatal(ErrorType::Compression))?;

            match status {
                Status::StreamEnd => return Ok(out),
                Status::Ok | Status::BufError => continue,
            }
        }
    }
}

/// Stateful raw-deflate decompressor, the inverse of `Deflater`. Reads the
/// uncompressed-length prefix, inflates into an exact-size target and
/// verifies the decoded length matches the prefix.
pub struct Inflater {
    state: Decompress,
}

impl Inflater {
    #[inline]
    pub fn new() -> Inflater {
        Inflater {
            state: Decompress::new(false),
        }
    }

    pub fn decompress(&mut self, input: &[u8]) -> NetResult<Vec<u8>> {
        if input.len() < 4 {
            return Err(NetError::Fatal(ErrorType::Compression));
        }

        let expected = LittleEndian::read_u32(&input[..4]) as usize;
        let deflated = &input[4..];

        self.state.reset(false);

        let mut out = Vec::with_capacity(expected);

        loop {
            let consumed = self.state.total_in() as usize;

            let status = self
                .state
                .decompress_vec(&deflated[consumed..], &mut out, FlushDecompress::Finish)
                .map_err(|_| NetError::Fatal(ErrorType::Compression))?;

            // A stream that keeps producing past the declared length is
            // corrupt; bail out instead of growing without bound.
            if out.len() > expected {
                return Err(NetError::Fatal(ErrorType::Compression));
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok => continue,
                Status::BufError => {
                    if out.len() == expected {
                        return Err(NetError::Fatal(ErrorType::Compression));
                    }
                    out.reserve(OUT_CHUNK);
                }
            }
        }

        if out.len() != expected {
            return Err(NetError::Fatal(ErrorType::Compression));
        }

        Ok(out)
    }
}
