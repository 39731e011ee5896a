//! Per-connection command handling: session state (`use`, `watch`) and
//! translation between core results and wire responses.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{Context as _, Result};
use burrow::broker::Broker;
use burrow::error::Error;
use burrow::line_reader::LineReader;
use burrow::parser::ParsingError;
use burrow::tube::{ReserveTicket, Tube};
use burrow::types::job::JobView;
use burrow::types::protocol::{Command, Response};
use burrow::types::serialisable::Serialisable;
use burrow::util::bytes_to_human_str;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

const DEFAULT_TUBE: &str = "default";

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
pub(crate) async fn begin_handle(
    broker: Arc<Broker>,
    max_job_size: u32,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let client = broker.client_id();
    let ret =
        handle_conn(Arc::clone(&broker), max_job_size, client, cancel, &mut conn)
            .await;

    // The connection is gone; hand its in-flight jobs back so other
    // consumers pick them up immediately rather than after the TTR.
    let released = broker.drop_client(client);
    if released > 0 {
        debug!(released, "released reservations of a closed connection");
    }

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}

async fn handle_conn(
    broker: Arc<Broker>,
    max_job_size: u32,
    client: u64,
    cancel: CancellationToken,
    conn: &mut TcpStream,
) -> Result<()> {
    // Split conn into read and write halves, where the read half uses our
    // LineReader.
    let (r, mut w) = conn.split();
    let mut r: LineReader<_> = r.into();

    let mut session = Session::new(broker, max_job_size, client);

    // Keep taking lines and parsing and processing them.
    loop {
        let line = select!(
           x = r.read_line() => match x? {
                Some(x) => x,
                None => return Ok(()),
           },
           _ = cancel.cancelled() => return Ok(()),
        );

        trace!(line = bytes_to_human_str(&line), "processing command");

        let cmd: Result<Command, ParsingError> = (&line as &[u8]).try_into();

        let resp = match cmd {
            Err(error) => error.serialise(),
            Ok(Command::Quit) => return Ok(()),
            // put carries a data body after the command line, so it is
            // handled here where the reader is available.
            Ok(Command::Put {
                pri,
                delay,
                ttr,
                n_bytes,
            }) => {
                let raw = match r.read_data(n_bytes as usize).await? {
                    Some(raw) => raw,
                    None => return Ok(()),
                };
                session.put(pri, delay, ttr, n_bytes, raw).serialise()
            },
            // The blocking commands. Dropping the reserve future on
            // cancellation deregisters any pending tickets.
            Ok(Command::Reserve) => select! {
                res = session.reserve(None) => reserve_response(res).serialise(),
                _ = cancel.cancelled() => return Ok(()),
            },
            Ok(Command::ReserveWithTimeout { timeout }) => select! {
                res = session.reserve(Some(Duration::from_secs(timeout.into()))) =>
                    reserve_response(res).serialise(),
                _ = cancel.cancelled() => return Ok(()),
            },
            Ok(cmd) => session.execute(cmd).serialise(),
        };

        // Slightly convoluted, but ensures we write out the buffer
        // properly with cancel safety.
        select! {
            x = w.write_all(&resp) => x,
            _ = cancel.cancelled() => return Ok(()),
        }?;

        // Flush any buffered packets once we've written out the one or
        // more responses. This provides a pipelined response to a
        // pipelined request.
        select! {
            x = w.flush() => x?,
            _ = cancel.cancelled() => return Ok(()),
        };
    }
}

struct Session {
    broker: Arc<Broker>,
    max_job_size: u32,
    /// This connection's consumer identity; reservations it takes are
    /// scoped to it.
    client: u64,
    used: String,
    watched: Vec<String>,
}

impl Session {
    fn new(broker: Arc<Broker>, max_job_size: u32, client: u64) -> Self {
        Self {
            broker,
            max_job_size,
            client,
            used: DEFAULT_TUBE.to_owned(),
            watched: vec![DEFAULT_TUBE.to_owned()],
        }
    }

    /// Handles a put whose body (including the trailing terminator) has
    /// already been read, keeping the stream in sync even for oversized
    /// or badly-terminated jobs.
    fn put(
        &self,
        pri: i64,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
        raw: Bytes,
    ) -> Response {
        if !raw.ends_with(b"\r\n") {
            return Response::ExpectedCRLF;
        }
        if n_bytes > self.max_job_size {
            return Response::JobTooBig;
        }

        let data = raw.slice(0..n_bytes as usize);
        // A zero TTR would time out instantly; treat it as one second.
        let ttr = ttr.max(1);

        match self.broker.put(
            &self.used,
            pri,
            Duration::from_secs(delay.into()),
            Duration::from_secs(ttr.into()),
            data,
        ) {
            Ok(id) => Response::Inserted { id },
            Err(Error::CapacityExceeded(_)) => Response::OutOfMemory,
            Err(_) => Response::InternalError,
        }
    }

    /// Blocks until a job from any watched tube is dispatched to this
    /// client, or the timeout elapses.
    async fn reserve(
        &self,
        timeout: Option<Duration>,
    ) -> std::result::Result<JobView, Error> {
        if let [name] = self.watched.as_slice() {
            return self.broker.tube(name).reserve(self.client, timeout).await;
        }

        // Register a ticket on every watched tube and take the first
        // delivery. Dropping the losing tickets deregisters them and
        // re-files any job that raced into an abandoned slot.
        let tubes: Vec<Arc<Tube>> =
            self.watched.iter().map(|name| self.broker.tube(name)).collect();
        let mut tickets: Vec<ReserveTicket<'_>> =
            tubes.iter().map(|tube| tube.ticket(self.client)).collect();

        let wait = poll_fn(|cx| {
            for ticket in tickets.iter_mut() {
                if let Poll::Ready(res) = Pin::new(&mut *ticket).poll(cx) {
                    return Poll::Ready(res);
                }
            }
            Poll::Pending
        });

        match timeout {
            None => wait.await,
            Some(t) => match time::timeout(t, wait).await {
                Ok(res) => res,
                Err(_elapsed) => Err(Error::TimedOut),
            },
        }
    }

    fn execute(&mut self, cmd: Command) -> Response {
        use Command::*;

        match cmd {
            Use { tube } => {
                self.used.clone_from(&tube);
                Response::Using { tube }
            },
            Watch { tube } => {
                if !self.watched.contains(&tube) {
                    self.watched.push(tube);
                }
                Response::Watching {
                    count: self.watched.len() as u32,
                }
            },
            Ignore { tube } => {
                if self.watched.len() == 1 && self.watched.contains(&tube) {
                    Response::NotIgnored
                } else {
                    self.watched.retain(|t| *t != tube);
                    Response::Watching {
                        count: self.watched.len() as u32,
                    }
                }
            },

            ReserveJob { id } => self.on_job(id, |tube| {
                tube.reserve_job(self.client, id).map(|view| {
                    Response::Reserved {
                        id: view.id,
                        data: view.data.to_vec(),
                    }
                })
            }),
            Release { id, pri, delay } => self.on_job(id, |tube| {
                tube.release(
                    self.client,
                    id,
                    pri,
                    Duration::from_secs(delay.into()),
                )
                .map(|()| Response::Released)
            }),
            Delete { id } => self.on_job(id, |tube| {
                tube.delete(self.client, id).map(|()| Response::Deleted)
            }),
            Bury { id, pri } => self.on_job(id, |tube| {
                tube.bury(self.client, id, pri).map(|()| Response::Buried)
            }),
            Touch { id } => self.on_job(id, |tube| {
                tube.touch(self.client, id).map(|()| Response::Touched)
            }),
            KickJob { id } => self.on_job(id, |tube| {
                tube.kick_job(id).map(|()| Response::Kicked)
            }),
            Peek { id } => self.on_job(id, |tube| tube.peek(id).map(found)),

            Kick { bound } => Response::KickedCount {
                count: self.broker.tube(&self.used).kick(bound),
            },
            PeekReady => self
                .broker
                .tube(&self.used)
                .peek_ready()
                .map_or(Response::NotFound, found),
            PeekDelayed => self
                .broker
                .tube(&self.used)
                .peek_delayed()
                .map_or(Response::NotFound, found),
            PeekBuried => self
                .broker
                .tube(&self.used)
                .peek_buried()
                .map_or(Response::NotFound, found),

            StatsJob { id } => self.on_job(id, |tube| {
                tube.job_stats(id)
                    .map(|data| Response::OkStatsJob { data })
            }),
            StatsTube { tube } => match self.broker.lookup(&tube) {
                Some(tube) => Response::OkStatsTube { data: tube.stats() },
                None => Response::NotFound,
            },
            StatsServer => Response::OkStats {
                data: self.broker.stats(),
            },
            ListTubes => Response::OkListTubes {
                tubes: self.broker.list_tubes(),
            },
            ListTubeUsed => Response::Using {
                tube: self.used.clone(),
            },
            ListTubesWatched => Response::OkListTubes {
                tubes: self.watched.clone(),
            },
            PauseTube { tube, delay } => match self.broker.lookup(&tube) {
                Some(tube) => {
                    tube.pause(Duration::from_secs(delay.into()));
                    Response::Paused
                },
                None => Response::NotFound,
            },

            // Handled in the connection loop before execute is called.
            Put { .. } | Reserve | ReserveWithTimeout { .. } | Quit => {
                debug!(?cmd, "command reached execute unexpectedly");
                Response::InternalError
            },
        }
    }

    /// Runs a job-addressed operation against the tube holding the job.
    /// Per the protocol, every core-level failure here (unknown id, wrong
    /// state, not reserved) collapses to NOT_FOUND.
    fn on_job<F>(&self, id: u64, f: F) -> Response
    where
        F: FnOnce(&Tube) -> std::result::Result<Response, Error>,
    {
        match self.broker.find(id) {
            Some(tube) => f(&tube).unwrap_or(Response::NotFound),
            None => Response::NotFound,
        }
    }
}

fn found(view: JobView) -> Response {
    Response::Found {
        id: view.id,
        data: view.data.to_vec(),
    }
}

fn reserve_response(res: std::result::Result<JobView, Error>) -> Response {
    match res {
        Ok(view) => Response::Reserved {
            id: view.id,
            data: view.data.to_vec(),
        },
        Err(Error::TimedOut) => Response::TimedOut,
        Err(_) => Response::InternalError,
    }
}
