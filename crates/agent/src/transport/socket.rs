//! Framed TCP link.
//!
//! Each [`LinkMessage`] travels as MessagePack inside a [`protocol::Frame`].
//! The agent opens with `Hello` (carrying the client key) and `Join`.

use bytes::{Buf, BytesMut};
use protocol::{Frame, FrameCodec, LinkMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::link::{LinkDriver, LinkSession};
use super::{TransportError, TransportFuture};
use crate::config::ControlConfig;

/// Initial capacity of the read buffer.
const READ_BUFFER_CAPACITY: usize = 8192;

pub struct SocketDriver {
    addr: String,
    client_key: String,
    codec: FrameCodec,
}

impl SocketDriver {
    pub fn new(control: &ControlConfig) -> Self {
        Self {
            addr: control.socket_addr.clone(),
            client_key: control.client_key(),
            codec: FrameCodec::new(),
        }
    }

    fn encode(&self, message: &LinkMessage) -> Result<Vec<u8>, TransportError> {
        let frame = Frame::new(message.to_msgpack()?);
        Ok(self.codec.encode(&frame)?)
    }

    /// Pull every complete frame out of `buf`.
    fn decode_all(&self, buf: &mut BytesMut) -> Result<Vec<LinkMessage>, TransportError> {
        let mut messages = Vec::new();
        while let Some((frame, consumed)) = self.codec.try_decode(buf)? {
            buf.advance(consumed);
            match LinkMessage::from_msgpack(&frame.payload) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(len = frame.payload.len(), "Dropping undecodable frame: {}", e),
            }
        }
        Ok(messages)
    }
}

impl LinkDriver for SocketDriver {
    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn run<'a>(&'a self, link: &'a mut LinkSession) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            let (mut reader, mut writer) = stream.into_split();

            let hello = LinkMessage::Hello {
                client_key: self.client_key.clone(),
            };
            let join = LinkMessage::Join {
                room_id: link.room_id().to_string(),
            };
            writer.write_all(&self.encode(&hello)?).await?;
            writer.write_all(&self.encode(&join)?).await?;
            link.mark_connected();
            tracing::info!(addr = %self.addr, "Socket link established");

            let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
            loop {
                tokio::select! {
                    outgoing = link.next_outgoing() => {
                        let Some(message) = outgoing else {
                            let _ = writer.shutdown().await;
                            return Err(TransportError::Closed);
                        };
                        writer.write_all(&self.encode(&message)?).await?;
                    }
                    read = reader.read_buf(&mut buf) => {
                        if read? == 0 {
                            return Ok(());
                        }
                        for message in self.decode_all(&mut buf)? {
                            if let Some(reply) = link.dispatch(message).await {
                                writer.write_all(&self.encode(&reply)?).await?;
                            }
                        }
                    }
                }
            }
        })
    }
}
