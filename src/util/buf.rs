use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


macro_rules! try_read_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked reads for wire decoding: they fail instead of panicking when the buffer is too short.
///
/// All fixed-width numbers are in network byte order (BE).
pub trait BufExt: Buf + Sized {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_i16, i16, get_i16);
    try_read_impl!(try_read_i32, i32, get_i32);
    try_read_impl!(try_read_i64, i64, get_i64);

    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_usize_varint()?;
        if self.remaining() < len {
            return Err(anyhow!("string length {} exceeds remaining buffer of {} bytes", len, self.remaining()));
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: BufMut + Sized {
    fn put_string(&mut self, s: &str) {
        self.put_usize_varint(s.len());
        self.put_slice(s.as_bytes());
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty(b"", None)]
    #[case::short(b"\0\0\x01", None)]
    #[case::exact(b"\0\0\x01\x02", Some(0x102))]
    #[case::negative(b"\xff\xff\xff\xff", Some(-1))]
    fn test_try_read_i32(#[case] mut buf: &[u8], #[case] expected: Option<i32>) {
        match buf.try_read_i32() {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[rstest]
    #[case::empty("")]
    #[case::ascii("socketId")]
    #[case::multi_byte("Größe")]
    fn test_string_round_trip(#[case] s: &str) {
        let mut buf = BytesMut::new();
        buf.put_string(s);
        buf.put_u8(7);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_buf.try_read_string().unwrap(), s);
        assert_eq!(read_buf, b"\x07");
    }

    #[test]
    fn test_try_read_string_truncated() {
        let mut buf = BytesMut::new();
        buf.put_string("abcdef");
        buf.truncate(4);

        let mut read_buf: &[u8] = &buf;
        assert!(read_buf.try_read_string().is_err());
    }
}
