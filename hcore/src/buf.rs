use std::cmp;
use std::io::{Error, ErrorKind, Read};

/// Reads until `buf` is full or the reader is exhausted.
/// Returns `(eof, filled)`.
pub fn fill_buf<R: Read>(data: &mut R, buf: &mut [u8]) -> std::io::Result<(bool, usize)> {
    let mut buf_read = 0;

    while buf_read < buf.len() {
        match data.read(&mut buf[buf_read..]) {
            Ok(0) => return Ok((true, buf_read)),
            Ok(x) => buf_read += x,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
    }
    Ok((false, buf_read))
}

/// Moves exactly `len` bytes from `data` into `sink`, one window at a time.
///
/// Memory use is bounded by `buf.len()` no matter how large `len` is. A reader
/// that runs dry early is reported as `UnexpectedEof`.
pub fn pump<R, F>(data: &mut R, len: u64, buf: &mut [u8], mut sink: F) -> std::io::Result<()>
where
    R: Read,
    F: FnMut(&[u8]) -> std::io::Result<()>,
{
    if buf.is_empty() && len > 0 {
        return Err(Error::new(ErrorKind::InvalidInput, "zero sized window"));
    }

    let mut remaining = len;
    while remaining > 0 {
        let want = cmp::min(remaining, buf.len() as u64) as usize;
        let (_, got) = fill_buf(data, &mut buf[..want])?;
        if got < want {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {} more bytes, got {}", remaining, got),
            ));
        }
        sink(&buf[..got])?;
        remaining -= got as u64;
    }
    Ok(())
}


#[cfg(test)]
mod test_pump {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn window_smaller_than_len() {
        let mut data = Cursor::new((0u8..10).collect::<Vec<u8>>());
        let mut buf = [0u8; 3];
        let mut seen = Vec::new();
        let mut calls = 0;

        pump(&mut data, 10, &mut buf, |chunk| {
            calls += 1;
            seen.extend_from_slice(chunk);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, (0u8..10).collect::<Vec<u8>>());
        assert_eq!(calls, 4);
    }

    #[test]
    fn stops_at_len() {
        let mut data = Cursor::new(vec![9u8; 100]);
        let mut buf = [0u8; 64];
        let mut total = 0;

        pump(&mut data, 70, &mut buf, |chunk| {
            total += chunk.len();
            Ok(())
        })
        .unwrap();

        assert_eq!(total, 70);
        assert_eq!(data.position(), 70);
    }

    #[test]
    fn short_reader() {
        let mut data = Cursor::new(vec![1u8, 2]);
        let mut buf = [0u8; 8];

        let err = pump(&mut data, 5, &mut buf, |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn zero_len_is_noop() {
        let mut data = Cursor::new(Vec::<u8>::new());
        let mut buf = [0u8; 0];

        pump(&mut data, 0, &mut buf, |_| panic!("no data expected")).unwrap();
    }
}
