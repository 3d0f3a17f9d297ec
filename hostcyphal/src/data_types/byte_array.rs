use heapless::Vec;
use hostcyphal_encoding::{
    DataType, Deserialize, DeserializeError, ReadCursor, Serialize, WriteCursor,
};

/// A simple (de)serializable type for tests and examples
///
/// Compatible with `uavcan.primitive.array.Natural8.1.0`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteArray {
    pub bytes: Vec<u8, 256>,
}

impl ByteArray {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Vec::from_slice(bytes).ok().map(|bytes| Self { bytes })
    }
}

impl DataType for ByteArray {
    /// This type is sealed.
    const EXTENT_BYTES: Option<u32> = None;
}

impl Deserialize for ByteArray {
    fn deserialize(cursor: &mut ReadCursor<'_>) -> Result<Self, DeserializeError>
    where
        Self: Sized,
    {
        let length = usize::from(cursor.read_aligned_u16());
        if length <= 256 {
            let mut bytes = Vec::new();
            bytes
                .resize_default(length)
                .map_err(|()| DeserializeError::ArrayLength)?;
            cursor.read_bytes(&mut bytes);

            Ok(Self { bytes })
        } else {
            Err(DeserializeError::ArrayLength)
        }
    }
}

impl Serialize for ByteArray {
    fn size_bits(&self) -> usize {
        16 + self.bytes.len() * 8
    }

    fn serialize(&self, cursor: &mut WriteCursor<'_>) {
        cursor.write_aligned_u16(self.bytes.len() as u16);
        cursor.write_aligned_bytes(&self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let original = ByteArray::from_slice(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        let image = hostcyphal_encoding::to_vec(&original);
        assert_eq!(image, [0x04, 0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(ByteArray::deserialize_from_bytes(&image).unwrap(), original);
    }
}
