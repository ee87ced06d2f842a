pub mod compress;
pub mod decoder;
pub mod encoder;
pub mod nbt;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use nbt::Tag;

/// Closes every tagged record. Everything written to a
/// [`ColumnStore`](crate::storage::ColumnStore) is a sequence of
/// `(tag: u8, payload)` fields ended by this tag, with big-endian integers
/// and entity payloads in the NBT tag format.
pub const TAG_END: u8 = 0;
