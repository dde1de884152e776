//! UDPBD client implementation.
//!
//! Speaks the appliance side of the protocol over a connected UDP socket. The
//! protocol never retransmits, so every wait for a reply is bounded by a timeout.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;

use crate::protocol::*;
use crate::transfer::TransferPlan;

/// UDPBD client for talking to a UDPBD server.
pub struct UdpbdClient {
    socket: UdpSocket,
    next_cmd_id: u8,
    timeout: Duration,
    /// Sector size reported by the server.
    pub sector_size: u32,
    /// Sector count reported by the server.
    pub sector_count: u32,
}

impl UdpbdClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Connect to a server and fetch its geometry.
    pub async fn connect(server: SocketAddr) -> Result<Self, UdpbdError> {
        Self::connect_with_timeout(server, Self::DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, UdpbdError> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let mut client = Self {
            socket,
            next_cmd_id: 0,
            timeout,
            sector_size: 0,
            sector_count: 0,
        };
        let (sector_size, sector_count) = client.info().await?;
        client.sector_size = sector_size;
        client.sector_count = sector_count;
        Ok(client)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UdpbdError> {
        Ok(self.socket.local_addr()?)
    }

    fn next_cmd_id(&mut self) -> u8 {
        let id = self.next_cmd_id;
        self.next_cmd_id = (id + 1) & CMD_ID_MAX;
        id
    }

    /// Query sector size and sector count.
    pub async fn info(&mut self) -> Result<(u32, u32), UdpbdError> {
        let cmd_id = self.next_cmd_id();
        self.send(&Message::Info(Header::new(Command::Info, cmd_id, 0)))
            .await?;

        loop {
            match self.recv("info reply").await? {
                Message::InfoReply(reply) if reply.header.cmd_id == cmd_id => {
                    return Ok((reply.sector_size, reply.sector_count));
                }
                _ => continue,
            }
        }
    }

    /// Read `sector_count` sectors starting at `sector`.
    ///
    /// Reply packets must arrive in order; a gap fails with `OutOfOrder`.
    pub async fn read(&mut self, sector: u32, sector_count: u16) -> Result<Bytes, UdpbdError> {
        if sector_count == 0 {
            return Ok(Bytes::new());
        }

        let expected = sector_count as usize * self.sector_size as usize;
        let cmd_id = self.next_cmd_id();
        self.send(&Message::Read(RwRequest {
            header: Header::new(Command::Read, cmd_id, 0),
            sector,
            sector_count,
        }))
        .await?;

        let mut buf = BytesMut::with_capacity(expected);
        let mut next_pkt: u8 = 1;
        while buf.len() < expected {
            let Message::ReadRdma(packet) = self.recv("read data").await? else {
                continue;
            };
            if packet.header.cmd_id != cmd_id {
                continue;
            }
            if packet.header.cmd_pkt != next_pkt {
                return Err(UdpbdError::OutOfOrder {
                    expected: next_pkt,
                    actual: packet.header.cmd_pkt,
                });
            }
            buf.extend_from_slice(&packet.data);
            next_pkt = next_pkt.wrapping_add(1);
        }

        if buf.len() != expected {
            return Err(UdpbdError::PayloadTooLarge {
                length_bytes: buf.len(),
                max_bytes: expected,
            });
        }
        Ok(buf.freeze())
    }

    /// Write whole sectors starting at `sector` and wait for completion.
    pub async fn write(&mut self, sector: u32, data: &[u8]) -> Result<(), UdpbdError> {
        let sector_size = self.sector_size as usize;
        if sector_size == 0 || data.len() % sector_size != 0 {
            return Err(UdpbdError::UnalignedTransfer {
                len: data.len(),
                unit: sector_size,
            });
        }
        let count = data.len() / sector_size;
        let sector_count =
            u16::try_from(count).map_err(|_| UdpbdError::TooManySectors { count })?;
        let plan = TransferPlan::new(data.len())?;

        let cmd_id = self.next_cmd_id();
        self.send(&Message::Write(RwRequest {
            header: Header::new(Command::Write, cmd_id, 0),
            sector,
            sector_count,
        }))
        .await?;

        for chunk in plan.chunks() {
            let packet = RdmaPacket {
                header: Header::new(Command::WriteRdma, cmd_id, (chunk.index + 1) as u8),
                block_type: chunk.block_type,
                data: Bytes::copy_from_slice(&data[chunk.offset..chunk.offset + chunk.len]),
            };
            self.send(&Message::WriteRdma(packet)).await?;
        }

        loop {
            match self.recv("write done").await? {
                Message::WriteDone(done) if done.header.cmd_id == cmd_id => {
                    if done.result != UDPBD_OK {
                        return Err(UdpbdError::ServerError { code: done.result });
                    }
                    return Ok(());
                }
                _ => continue,
            }
        }
    }

    /// Send raw bytes as one datagram.
    pub async fn send_raw(&self, datagram: &[u8]) -> Result<(), UdpbdError> {
        self.socket.send(datagram).await?;
        Ok(())
    }

    /// Receive one raw datagram, or `None` if nothing arrives within `wait`.
    pub async fn recv_raw(&self, wait: Duration) -> Result<Option<Bytes>, UdpbdError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 64];
        match tokio::time::timeout(wait, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn send(&self, message: &Message) -> Result<(), UdpbdError> {
        self.socket.send(&message.encode()).await?;
        Ok(())
    }

    async fn recv(&self, waiting_for: &'static str) -> Result<Message, UdpbdError> {
        let datagram = self
            .recv_raw(self.timeout)
            .await?
            .ok_or(UdpbdError::Timeout { waiting_for })?;
        Message::decode(&datagram)
    }
}
