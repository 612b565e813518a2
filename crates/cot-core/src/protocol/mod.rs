//! Wire formats: stream readers, the protobuf envelope, and the event codec.
//!
//! Reading is split in two layers.  The stream readers in [`frame`] cut raw
//! elements or frames out of a byte stream without interpreting them; the
//! [`codec`] then turns those bytes into [`CotMessage`](crate::CotMessage)s.
//! [`control`] builds and recognises the relay's own control events.

pub mod codec;
pub mod control;
pub mod frame;
pub mod proto;
pub mod varint;

pub use codec::{Codec, CodecError, StructuredTag, EVENT_TAG};
pub use control::Control;
pub use frame::{
    make_frame, FrameError, FrameReader, RawTag, TagReader, DEFAULT_MAX_FRAME_LEN,
    DEFAULT_MAX_TAG_LEN, MAGIC,
};
pub use proto::{decode_tak_message, encode_tak_message, ProtoError};
pub use varint::VarintError;
