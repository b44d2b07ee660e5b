use anyhow::{Context, Result};

/// Integers readable from a little-endian byte slice.
pub(crate) trait FromLeBytes: Sized {
    const SIZE: usize;
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_from_le_bytes {
    ($($ty:ty),*) => {
        $(impl FromLeBytes for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();

            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; core::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                Self::from_le_bytes(buf)
            }
        })*
    };
}

impl_from_le_bytes!(u16, u32, u64);

/// Reads a little-endian integer at `offset`, attaching `what` to any
/// out-of-bounds error.
pub(crate) fn read_le<T: FromLeBytes>(data: &[u8], offset: usize, what: &str) -> Result<T> {
    let bytes = offset
        .checked_add(T::SIZE)
        .and_then(|end| data.get(offset..end))
        .with_context(|| format!("{what}: truncated read at offset {offset:#x}"))?;
    Ok(T::from_le_slice(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        assert_eq!(read_le::<u16>(&data, 0, "u16").unwrap(), 0x0201);
        assert_eq!(read_le::<u32>(&data, 1, "u32").unwrap(), 0x05040302);
        assert_eq!(read_le::<u64>(&data, 1, "u64").unwrap(), 0x0908070605040302);
    }

    #[test]
    fn rejects_truncated_reads() {
        let data = [0u8; 4];
        let err = read_le::<u32>(&data, 1, "version field").unwrap_err();
        assert!(err.to_string().contains("version field"));
        assert!(read_le::<u64>(&data, usize::MAX, "tail").is_err());
    }
}
