pub mod decoder;

pub use decoder::{DecodedLine, StreamDecoder};
