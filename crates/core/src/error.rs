#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
}
