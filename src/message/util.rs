use std::io::{self, prelude::*};

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Read a little-endian usize out of the given stream.
///
pub fn read_usize<R: Read>(stream: &mut R) -> io::Result<usize> {
    let mut buffer = [0; std::mem::size_of::<usize>()];
    stream.read_exact(&mut buffer)?;
    Ok(usize::from_le_bytes(buffer))
}

/// Read the given number of bytes from a stream, into a vec.
///
pub fn read_bytes_vec<R: Read>(stream: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0; size];
    stream.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Write a length-prefixed frame.
///
pub fn write_frame<W: Write>(stream: &mut W, message: &[u8]) -> io::Result<()> {
    stream.write_all(&message.len().to_le_bytes())?;
    stream.write_all(message)?;
    stream.flush()
}

#[cfg(test)]
mod test {

    use std::io::Cursor;
    use super::*;

    #[test]
    fn ceil_log2_works() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn frames_can_be_read_back() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"drift").unwrap();
        let mut cursor = Cursor::new(buffer);
        let size = read_usize(&mut cursor).unwrap();
        assert_eq!(read_bytes_vec(&mut cursor, size).unwrap(), b"drift");
        assert!(read_usize(&mut cursor).is_err());
    }
}
