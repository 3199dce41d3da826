//! The seam between framing and the application message model.

use crate::framing::Frame;

/// A message type that travels inside [`Frame`]s.
///
/// Connections are generic over this trait so the transport never needs to
/// know which message kinds exist.
pub trait WireMessage: Sized + Send + 'static {
    /// Error produced when a message cannot be encoded or decoded.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encode into a frame (type token plus payload).
    fn to_frame(&self) -> Result<Frame, Self::Error>;

    /// Decode from a received frame.
    fn from_frame(frame: &Frame) -> Result<Self, Self::Error>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Plain text message used by the transport tests.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Text(pub String);

    #[derive(Debug, thiserror::Error)]
    #[error("unknown kind {0}")]
    pub struct UnknownKind(pub String);

    impl WireMessage for Text {
        type Error = UnknownKind;

        fn to_frame(&self) -> Result<Frame, Self::Error> {
            Ok(Frame::new("TEXT", self.0.as_bytes()))
        }

        fn from_frame(frame: &Frame) -> Result<Self, Self::Error> {
            if frame.kind != "TEXT" {
                return Err(UnknownKind(frame.kind.clone()));
            }
            Ok(Text(String::from_utf8_lossy(&frame.payload).into_owned()))
        }
    }
}
