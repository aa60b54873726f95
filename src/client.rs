//! One-shot query client.
//!
//! Every transport failure, including a timeout, surfaces as
//! `Error::ServerUnavailable`. No retries happen here.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::core::{AngleRecord, Error, Result};
use crate::protocol::{Request, Response, ServerStatus};

#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    /// Bound on connect and on each request round-trip.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(Error::ServerUnavailable)?
            .collect();
        let mut last_err =
            std::io::Error::new(ErrorKind::AddrNotAvailable, "no address to connect to");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.timeout) {
                Ok(stream) => return Self::from_stream(stream, config),
                Err(err) => last_err = err,
            }
        }
        Err(Error::ServerUnavailable(last_err))
    }

    fn from_stream(stream: TcpStream, config: ClientConfig) -> Result<Self> {
        stream
            .set_read_timeout(Some(config.timeout))
            .map_err(Error::ServerUnavailable)?;
        stream
            .set_write_timeout(Some(config.timeout))
            .map_err(Error::ServerUnavailable)?;
        let writer = stream.try_clone().map_err(Error::ServerUnavailable)?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Latest record, `None` when the server has not observed any yet.
    pub fn latest(&mut self) -> Result<Option<AngleRecord>> {
        match self.request(Request::Latest)? {
            Response::Ok { record } => Ok(Some(record)),
            Response::NoData => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn recent(&mut self, count: usize) -> Result<Vec<AngleRecord>> {
        match self.request(Request::Recent(count))? {
            Response::Recent { records } => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    pub fn status(&mut self) -> Result<ServerStatus> {
        match self.request(Request::Status)? {
            Response::Server(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    fn request(&mut self, request: Request) -> Result<Response> {
        self.writer
            .write_all(request.encode_line().as_bytes())
            .map_err(Error::ServerUnavailable)?;
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(Error::ServerUnavailable)?;
        if read == 0 || !line.ends_with('\n') {
            return Err(Error::ServerUnavailable(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        match Response::decode_line(&line)? {
            Response::Error { message } => Err(Error::Protocol(message)),
            response => Ok(response),
        }
    }
}

fn unexpected(response: Response) -> Error {
    Error::Protocol(format!("unexpected response {response:?}"))
}

/// Connects, asks for the latest record once, and disconnects.
pub fn query_latest(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Option<AngleRecord>> {
    Client::connect(addr, config)?.latest()
}
