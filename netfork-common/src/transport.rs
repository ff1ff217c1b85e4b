use std::{
    io::{self, Read, Write},
    mem::{size_of, MaybeUninit},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    slice,
};

use anyhow::{bail, ensure, Context, Result};

use crate::proto::Wire;

/// Default service port, shared by both binaries.
pub const SERVICE_PORT: u16 = 43594;

pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub fn listen(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("failed to bind")?;

        Ok(Self { listener })
    }

    /// Accepts exactly one client and closes the listener.
    pub fn accept_single(self) -> Result<Connection> {
        let (socket, peer_addr) = self.listener.accept().context("failed to accept")?;

        Ok(Connection { socket, peer_addr })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }
}

pub struct Connection {
    socket: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr).context("failed to connect")?;
        let peer_addr = socket.peer_addr()?;

        Ok(Self { socket, peer_addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send_value<T: Wire>(&mut self, value: &T) -> Result<()> {
        self.send_bytes(as_bytes(value))
    }

    pub fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Ok(self.socket.write_all(buf)?)
    }

    pub fn recv_value<T: Wire>(&mut self) -> Result<T> {
        match self.try_recv_value()? {
            Some(value) => Ok(value),
            None => bail!("connection closed"),
        }
    }

    /// Receives a record, or `None` if the peer closed the connection on a
    /// record boundary. Closing mid-record is an error.
    pub fn try_recv_value<T: Wire>(&mut self) -> Result<Option<T>> {
        let mut value = MaybeUninit::<T>::uninit();
        let buf = unsafe {
            slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>())
        };

        let received = self.recv_full(buf)?;
        if received == 0 {
            return Ok(None);
        }
        ensure!(
            received == buf.len(),
            "connection closed after {received} of {} bytes",
            buf.len()
        );

        Ok(Some(unsafe { value.assume_init() }))
    }

    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let received = self.recv_full(buf)?;
        ensure!(
            received == buf.len(),
            "connection closed after {received} of {} bytes",
            buf.len()
        );

        Ok(())
    }

    // A single read may return fewer bytes than requested; keep reading from
    // the end of the previous read until the buffer is full or the peer
    // closes the connection.
    fn recv_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.socket.read(&mut buf[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(offset)
    }

    /// Half-closes the send direction and drains until the peer closes,
    /// guaranteeing the peer has consumed everything we sent.
    pub fn finish(self) -> Result<()> {
        self.socket.shutdown(Shutdown::Write)?;

        let mut socket = self.socket;
        let mut sink = [0u8; 512];
        loop {
            match socket.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

fn as_bytes<T: Wire>(value: &T) -> &[u8] {
    unsafe { slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SubregionInfo;

    #[test]
    fn roundtrips_records_and_bytes() {
        let server = Server::listen(([127u8, 0, 0, 1], 0).into()).unwrap();
        let port = server.port();
        let mut client = Connection::connect(("127.0.0.1", port)).unwrap();
        let mut con = server.accept_single().unwrap();

        let sub = SubregionInfo {
            base_address: 0x7ff6_0000_0000,
            region_size: 0x2000,
            protect: 0x04,
        };
        client.send_value(&sub).unwrap();
        client.send_bytes(&[0xde, 0xad, 0xbe, 0xef]).unwrap();

        assert_eq!(con.recv_value::<SubregionInfo>().unwrap(), sub);
        let mut buf = [0u8; 4];
        con.recv_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn distinguishes_clean_close_from_truncation() {
        let server = Server::listen(([127u8, 0, 0, 1], 0).into()).unwrap();
        let port = server.port();
        let client = Connection::connect(("127.0.0.1", port)).unwrap();
        let mut con = server.accept_single().unwrap();

        drop(client);
        assert!(con.try_recv_value::<SubregionInfo>().unwrap().is_none());

        let server = Server::listen(([127u8, 0, 0, 1], 0).into()).unwrap();
        let port = server.port();
        let mut client = Connection::connect(("127.0.0.1", port)).unwrap();
        let mut con = server.accept_single().unwrap();

        client.send_bytes(&[1, 2, 3]).unwrap();
        drop(client);
        assert!(con.try_recv_value::<SubregionInfo>().is_err());
    }
}
