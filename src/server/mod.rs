//! Long-lived query server.
//!
//! A tail thread follows the log and publishes new records into the cache;
//! one thread per connection answers queries from the cache. Query handlers
//! only take read guards and never touch the log file or its lock.

pub mod cache;

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::core::store::LOG_FILE;
use crate::core::{Error, LogTail, Result, TailFault};
use crate::protocol::{Request, Response, DEFAULT_PORT, MAX_REQUEST_LEN};
use crate::shutdown::{Shutdown, SHUTDOWN_SLICE};

pub use cache::ServerCache;

const ACCEPT_IDLE: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Upper bound on how stale the cache is relative to the log.
    pub poll_interval: Duration,
    pub recent_capacity: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            poll_interval: Duration::from_millis(200),
            recent_capacity: 64,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    tail: LogTail,
    cache: RwLock<ServerCache>,
    config: ServerConfig,
}

impl Server {
    /// Replays the existing log into the cache and binds the listener.
    pub fn bind(dir: impl AsRef<Path>, config: ServerConfig) -> Result<Self> {
        if config.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".into()));
        }
        let mut tail = LogTail::new(dir.as_ref().join(LOG_FILE));
        let cache = RwLock::new(ServerCache::new(config.recent_capacity));
        match tail.poll() {
            Ok(batch) => {
                let offset = tail.position().offset;
                let mut guard = write_cache(&cache);
                guard.publish(batch, offset);
                info!(
                    "replayed {} records from {}",
                    guard.status().observed,
                    tail.path().display()
                );
            }
            Err(Error::TailFailure(TailFault::Missing)) => {
                info!("{} not created yet; waiting for the logger", tail.path().display());
            }
            Err(err) => {
                warn!("initial replay failed: {err}");
                write_cache(&cache).record_tail_failure();
            }
        }

        let listener = TcpListener::bind(config.bind)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            tail,
            cache,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` is requested, then waits for every connection
    /// thread and the tail thread to finish.
    pub fn run(self, shutdown: &Shutdown) -> Result<()> {
        let Server {
            listener,
            mut tail,
            cache,
            config,
        } = self;
        info!("serving latest angle on {}", listener.local_addr()?);
        let cache = &cache;
        thread::scope(|scope| {
            scope.spawn(|| follow_log(&mut tail, cache, config.poll_interval, shutdown));

            while !shutdown.is_requested() {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("client connected from {peer}");
                        scope.spawn(move || {
                            if let Err(err) = serve_connection(stream, cache, &config, shutdown) {
                                debug!("client {peer} dropped: {err}");
                            }
                        });
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_IDLE);
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        thread::sleep(ACCEPT_IDLE);
                    }
                }
            }
        });
        info!("server stopped");
        Ok(())
    }
}

fn read_cache(cache: &RwLock<ServerCache>) -> RwLockReadGuard<'_, ServerCache> {
    cache.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_cache(cache: &RwLock<ServerCache>) -> RwLockWriteGuard<'_, ServerCache> {
    cache.write().unwrap_or_else(PoisonError::into_inner)
}

fn follow_log(
    tail: &mut LogTail,
    cache: &RwLock<ServerCache>,
    poll_interval: Duration,
    shutdown: &Shutdown,
) {
    let mut failing = false;
    while !shutdown.sleep(poll_interval) {
        // File I/O happens before the write guard is taken.
        match tail.poll() {
            Ok(batch) => {
                if failing {
                    info!("log tail recovered at offset {}", tail.position().offset);
                    failing = false;
                }
                if batch.is_empty() && batch.reset.is_none() && batch.skipped == 0 {
                    continue;
                }
                let offset = tail.position().offset;
                write_cache(cache).publish(batch, offset);
            }
            Err(err) => {
                if !failing {
                    warn!("log tail failed, serving cached data: {err}");
                    failing = true;
                }
                write_cache(cache).record_tail_failure();
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    cache: &RwLock<ServerCache>,
    config: &ServerConfig,
    shutdown: &Shutdown,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(SHUTDOWN_SLICE))?;
    stream.set_write_timeout(Some(config.idle_timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut oversized = false;
    let mut last_activity = Instant::now();

    while !shutdown.is_requested() {
        // Never buffer more than one byte past the request limit.
        let budget = (MAX_REQUEST_LEN + 1).saturating_sub(line.len()) as u64;
        match reader.by_ref().take(budget).read_until(b'\n', &mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let terminated = line.last() == Some(&b'\n');
                if !terminated && line.len() > MAX_REQUEST_LEN {
                    if !oversized {
                        debug!("discarding request longer than {MAX_REQUEST_LEN} bytes");
                        oversized = true;
                    }
                    line.clear();
                    continue;
                }
                if oversized {
                    if !terminated {
                        return Ok(());
                    }
                    let response = Response::Error {
                        message: "request too long".into(),
                    };
                    writer.write_all(response.encode_line()?.as_bytes())?;
                    oversized = false;
                } else {
                    respond(&mut writer, &line, cache)?;
                    if !terminated {
                        return Ok(());
                    }
                }
                line.clear();
                last_activity = Instant::now();
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if !oversized && Request::parse_bare(&line).is_some() {
                    respond(&mut writer, &line, cache)?;
                    line.clear();
                    last_activity = Instant::now();
                } else if last_activity.elapsed() >= config.idle_timeout {
                    debug!("closing idle connection");
                    return Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

fn respond(writer: &mut TcpStream, line: &[u8], cache: &RwLock<ServerCache>) -> Result<()> {
    let response = match std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("request not utf-8".into()))
        .and_then(Request::parse)
    {
        Ok(request) => answer(request, &read_cache(cache)),
        Err(err) => Response::Error {
            message: err.to_string(),
        },
    };
    writer.write_all(response.encode_line()?.as_bytes())?;
    Ok(())
}

/// Builds the response for one request from a cache snapshot.
pub fn answer(request: Request, cache: &ServerCache) -> Response {
    match request {
        Request::Latest => match cache.latest() {
            Some(record) => Response::Ok { record },
            None => Response::NoData,
        },
        Request::Recent(count) => Response::Recent {
            records: cache.recent(count),
        },
        Request::Status => Response::Server(cache.status()),
    }
}
