use hostcyphal_encoding::{
    DataType, Deserialize, DeserializeError, ReadCursor, Serialize, WriteCursor,
};

/// `uavcan.primitive.Empty.1.0`
///
/// Fixed size 0 bytes. Can be used to retrieve metadata without caring for the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Empty {}

impl DataType for Empty {
    /// This type is sealed.
    const EXTENT_BYTES: Option<u32> = None;
}

impl Deserialize for Empty {
    fn deserialize(_cursor: &mut ReadCursor<'_>) -> Result<Self, DeserializeError>
    where
        Self: Sized,
    {
        Ok(Self {})
    }
}

impl Serialize for Empty {
    fn size_bits(&self) -> usize {
        0
    }

    fn serialize(&self, _cursor: &mut WriteCursor<'_>) {}
}
