use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single `Data` payload accepted off the wire.
///
/// Pumps never emit chunks larger than their buffer size, so anything above this
/// is either a corrupt length or a hostile peer.
pub const MAX_DATA_PAYLOAD: u64 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("data payload too large: {0}")]
    PayloadTooLarge(u64),
    #[error("link closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer closed the stream cleanly between two frames.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data = 0,
    HeartBeat = 1,
    EndOfStream = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(MessageKind::Data),
            1 => Ok(MessageKind::HeartBeat),
            2 => Ok(MessageKind::EndOfStream),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One unit of the tunnel <-> agent wire protocol.
///
/// ```text
/// Data        : 0x00 | len:u64-LE | payload[len]
/// HeartBeat   : 0x01
/// EndOfStream : 0x02
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(Bytes),
    HeartBeat,
    EndOfStream,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Data(_) => MessageKind::Data,
            Message::HeartBeat => MessageKind::HeartBeat,
            Message::EndOfStream => MessageKind::EndOfStream,
        }
    }
}

/// Decodes one message.
///
/// Every field is filled with `read_exact`, which keeps polling until the requested
/// byte count is satisfied, so a transport that hands out one byte per read still
/// yields whole frames. A clean close before the kind byte is `Closed`; a close in
/// the middle of a frame surfaces as `Io(UnexpectedEof)`.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtocolError> {
    let mut kind = [0u8; 1];
    loop {
        match r.read(&mut kind).await {
            Ok(0) => return Err(ProtocolError::Closed),
            Ok(_) => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    match MessageKind::try_from(kind[0])? {
        MessageKind::HeartBeat => Ok(Message::HeartBeat),
        MessageKind::EndOfStream => Ok(Message::EndOfStream),
        MessageKind::Data => {
            let len = r.read_u64_le().await?;
            if len > MAX_DATA_PAYLOAD {
                return Err(ProtocolError::PayloadTooLarge(len));
            }
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload).await?;
            Ok(Message::Data(Bytes::from(payload)))
        }
    }
}

/// Encodes one message and flushes it. `write_all` loops until every byte is accepted.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    w.write_u8(msg.kind() as u8).await?;
    if let Message::Data(payload) = msg {
        w.write_u64_le(payload.len() as u64).await?;
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Write side of a framed link that may be shared by several writers.
///
/// Each message is encoded while holding the lock, so frames from different
/// writers never interleave on the wire.
pub struct FramedWriter<W> {
    inner: Arc<tokio::sync::Mutex<W>>,
}

impl<W> Clone for FramedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(w)),
        }
    }

    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let mut w = self.inner.lock().await;
        write_message(&mut *w, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode(msg: &Message) -> Vec<u8> {
        let mut out = Vec::new();
        write_message(&mut out, msg).await.unwrap();
        out
    }

    #[tokio::test]
    async fn wire_layout_is_byte_exact() {
        assert_eq!(encode(&Message::HeartBeat).await, vec![0x01]);
        assert_eq!(encode(&Message::EndOfStream).await, vec![0x02]);
        assert_eq!(
            encode(&Message::Data(Bytes::from_static(b"hi"))).await,
            vec![0x00, 2, 0, 0, 0, 0, 0, 0, 0, b'h', b'i']
        );
    }

    #[tokio::test]
    async fn data_roundtrip_preserves_payload_including_empty() {
        for payload in [&b""[..], &b"x"[..], &b"hello tunnel"[..], &[0u8; 1024][..]] {
            let msg = Message::Data(Bytes::copy_from_slice(payload));
            let wire = encode(&msg).await;
            assert_eq!(wire.len(), 9 + payload.len());

            let got = read_message(&mut wire.as_slice()).await.unwrap();
            assert_eq!(got, msg);
        }
    }

    #[tokio::test]
    async fn unknown_kinds_are_rejected() {
        for b in [0x03u8, 0x04, 0x7f, 0xff] {
            let wire = [b, 0, 0, 0];
            let err = read_message(&mut &wire[..]).await.unwrap_err();
            match err {
                ProtocolError::UnknownKind(k) => assert_eq!(k, b),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn control_kinds_ignore_trailing_bytes() {
        let wire = [0x01u8, 0xaa, 0xbb, 0x02, 0x00];
        let mut r = &wire[..];
        assert_eq!(read_message(&mut r).await.unwrap(), Message::HeartBeat);
        // The bytes after a control message belong to whatever comes next.
        assert_eq!(r, &[0xaau8, 0xbb, 0x02, 0x00][..]);

        let mut r = &wire[3..];
        assert_eq!(read_message(&mut r).await.unwrap(), Message::EndOfStream);
        assert_eq!(r, &[0x00u8][..]);
    }

    #[tokio::test]
    async fn decode_survives_one_byte_fragments() {
        // A duplex with capacity 1 never lets the reader see more than one byte per read.
        let (mut a, mut b) = tokio::io::duplex(1);
        let payload = Bytes::from_static(b"fragmented payload");
        let wire = encode(&Message::Data(payload.clone())).await;

        let w = tokio::spawn(async move {
            for byte in wire {
                a.write_all(&[byte]).await.unwrap();
            }
            a.write_all(&[0x02]).await.unwrap();
        });

        assert_eq!(read_message(&mut b).await.unwrap(), Message::Data(payload));
        assert_eq!(read_message(&mut b).await.unwrap(), Message::EndOfStream);
        w.await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_differs_from_truncated_frame() {
        let err = read_message(&mut &b""[..]).await.unwrap_err();
        assert!(err.is_closed());

        let truncated = [0x00u8, 5, 0, 0, 0, 0, 0, 0, 0, b'a'];
        let err = read_message(&mut &truncated[..]).await.unwrap_err();
        match err {
            ProtocolError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_without_reading_payload() {
        let mut wire = vec![0x00u8];
        wire.extend_from_slice(&(MAX_DATA_PAYLOAD + 1).to_le_bytes());
        let err = read_message(&mut wire.as_slice()).await.unwrap_err();
        match err {
            ProtocolError::PayloadTooLarge(n) => assert_eq!(n, MAX_DATA_PAYLOAD + 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shared_writer_keeps_frames_whole() {
        let (a, mut b) = tokio::io::duplex(64);
        let w = FramedWriter::new(a);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let w = w.clone();
            tasks.push(tokio::spawn(async move {
                let payload = Bytes::from(vec![i; 300]);
                w.send(&Message::Data(payload)).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            match read_message(&mut b).await.unwrap() {
                Message::Data(p) => {
                    assert_eq!(p.len(), 300);
                    assert!(p.iter().all(|&x| x == p[0]));
                    seen.push(p[0]);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        for t in tasks {
            t.await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8u8).collect::<Vec<_>>());
    }
}
