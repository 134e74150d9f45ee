use std::io;

/// Values smaller than this are stored as-is, zstd framing would only make them bigger.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Compresses a cache value with zstd at the given level.
///
/// Returns `None` if the value is too small to be worth compressing.
pub fn compress_value(data: &[u8], level: i32) -> io::Result<Option<Vec<u8>>> {
    if data.len() < MIN_COMPRESS_SIZE {
        return Ok(None);
    }
    let compressed = zstd::bulk::compress(data, level)?;
    metric!(time_raw("compression.input_size") = data.len() as u64);
    metric!(time_raw("compression.output_size") = compressed.len() as u64);
    Ok(Some(compressed))
}

/// Decompresses a cache value that was written by [`compress_value`].
pub fn decompress_value(data: &[u8]) -> io::Result<Vec<u8>> {
    // Magic bytes for zstd
    // https://tools.ietf.org/id/draft-kucherawy-dispatch-zstd-00.html#rfc.section.2.1.1
    if !data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compressed value is missing the zstd frame header",
        ));
    }
    metric!(counter("compression") += 1, "type" => "zstd");
    zstd::stream::decode_all(data)
}
