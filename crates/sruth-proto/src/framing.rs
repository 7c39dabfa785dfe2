use byteorder::{BigEndian, ByteOrder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Every frame is a 4-byte big-endian length prefix followed by a bincode
/// payload (§6, "Wire format").
pub const LENGTH_PREFIX_LEN: usize = 4;

/// No legitimate message in this protocol approaches this size; a longer
/// prefix is treated as a protocol violation rather than an allocation
/// request.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FramingError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("connection closed before a full frame was read")]
    Eof,
    #[error("malformed frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to encode outgoing frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FramingError::FrameTooLarge(payload.len() as u32));
    }
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    BigEndian::write_u32(&mut prefix, payload.len() as u32);
    writer.write_all(&prefix).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FramingError::Eof),
        Err(e) => return Err(e.into()),
    }
    let len = BigEndian::read_u32(&prefix);
    if len > MAX_FRAME_LEN {
        return Err(FramingError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let (value, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[tokio::test]
    async fn frame_roundtrips_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let value = Sample {
            a: 7,
            b: "hello".into(),
        };
        write_frame(&mut a, &value).await.unwrap();
        let back: Sample = read_frame(&mut b).await.unwrap();
        assert_eq!(value, back);
    }

    #[tokio::test]
    async fn eof_before_prefix_is_reported_distinctly() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let err = read_frame::<_, Sample>(&mut b).await.unwrap_err();
        assert!(matches!(err, FramingError::Eof));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_before_allocating() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        BigEndian::write_u32(&mut prefix, MAX_FRAME_LEN + 1);
        a.write_all(&prefix).await.unwrap();
        let err = read_frame::<_, Sample>(&mut b).await.unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge(_)));
    }
}
