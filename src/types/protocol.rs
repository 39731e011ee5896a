use serde::Serialize;

use super::serialisable::Serialisable;
use super::states::JobState;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Places a job onto the currently `use`d tube.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <n_bytes>`, followed by the
    /// job body.
    Put {
        pri: i64,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from all the `watch`ed tubes, blocking until one
    /// appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT`
    /// response is sent instead.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Reserves the job with the given ID if it is currently ready,
    /// otherwise returning `NOT_FOUND`.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: u64 },
    /// Returns a reserved job to the ready (or, with a delay, the
    /// delayed) state. Returns `RELEASED` or `NOT_FOUND`.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: i64, delay: u32 },
    /// Deletes a reserved or buried job. Returns `DELETED`, or
    /// `NOT_FOUND` for unknown jobs and for jobs that are ready or
    /// delayed (those must be reserved first).
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Buries a reserved job. Returns `BURIED` or `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: i64 },
    /// Refreshes the Time To Run (TTR) window of a reserved job. Returns
    /// `TOUCHED` or `NOT_FOUND`.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to the watchlist for this client. Always replies with
    /// `WATCHING <number of watched tubes>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Reverses the effect of `watch` on this client. Returns
    /// `WATCHING <n>`, or `NOT_IGNORED` if this would remove the last
    /// tube in the watchlist.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Returns the data for the job with this ID, regardless of state.
    /// Response is either `FOUND <id> <bytes>` or `NOT_FOUND`, in common
    /// with all requests in the `peek` family.
    ///
    /// On the wire: `peek <id>`
    Peek { id: u64 },
    /// Returns the data for the next ready job on the currently-used
    /// tube.
    ///
    /// On the wire: `peek-ready`
    PeekReady,
    /// Returns the data for the next delayed job that will become ready
    /// on the currently-used tube.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Returns the data for the oldest buried job on the currently-used
    /// tube.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Promotes up to `bound` jobs on the currently-used tube from buried
    /// to ready, returning `KICKED <count>` with the actual number of
    /// jobs kicked. If no buried jobs exist, it promotes delayed jobs
    /// instead.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Promotes a single buried or delayed job to ready by its ID.
    /// Returns `KICKED` if successful, otherwise `NOT_FOUND` if the job
    /// ID doesn't exist or the job is not kickable.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: u64 },
    /// Provides information about the job with the given ID, including
    /// which tube it's on, state, priority, timings, and the number of
    /// state transitions it's undergone.
    ///
    /// As with all responses from the `Stats` family of commands, returns
    /// an `OK <n_bytes>` response with YAML-format data.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// Returns information about a tube, including the number of jobs in
    /// each state, total jobs handled, and pause status.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: String },
    /// Exposes information about the server, including global job counts
    /// by state and uptime.
    ///
    /// On the wire: `stats`
    StatsServer,
    /// Returns a list of which tubes currently exist, as a YAML list.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// Returns the tube name this client is currently using as
    /// `USING <tube>`.
    ///
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// Returns any tubes this client is currently watching.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Requests that the server close this connection, releasing any
    /// server-side resources in doing so.
    ///
    /// On the wire: `quit`
    Quit,
    /// Pause a tube for a given period, preventing new jobs being
    /// reserved for `delay` seconds. Returns `PAUSED` or `NOT_FOUND`.
    ///
    /// On the wire: `pause-tube <tube> <delay>`
    PauseTube { tube: String, delay: u32 },
    /// On the wire: `use <tube>`
    Use { tube: String },
}

/// All possible response types to a [`Command`].
pub enum Response {
    /// Indicates the server cannot accept a job because the target tube
    /// is at its configured job limit. Sent in response to `put`.
    ///
    /// On the wire: `OUT_OF_MEMORY`.
    OutOfMemory,
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The client sent a request the server couldn't parse.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The client sent a request with an unrecognised command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `put`, indicates a job was created with the given
    /// ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, indicates the job data was not terminated
    /// by a CRLF sequence.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// In response to a `put`, indicates the job body was larger than
    /// what the server is configured to accept.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `use` or `list-tube-used`, indicates the client
    /// is using this tube.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: String },
    /// In response to a `reserve-with-timeout`, indicates the timeout
    /// provided expired with no job becoming available.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// In response to a `reserve`, `reserve-with-timeout`, or
    /// `reserve-job`, provides the ID and data of the job that was just
    /// reserved.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: u64, data: Vec<u8> },
    /// In response to any of the following commands, indicates a general
    /// state where a specific job isn't known to the server, or doesn't
    /// satisfy a precondition to be returned by the command.
    ///
    /// Specific cases include:
    ///
    /// * `reserve-job`: the job is not ready or unknown.
    /// * `delete`: the job is unknown, or isn't reserved or buried.
    /// * `release`, `bury`, or `touch`: the job is unknown or is not
    ///   reserved.
    /// * `peek`: the job is unknown.
    /// * `peek-*` family: no such jobs exist on the currently `use`d
    ///   tube.
    /// * `kick-job`: the job is unknown or is neither buried nor
    ///   delayed.
    /// * `pause-tube` and `stats-tube`: the tube does not exist.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `delete` command, indicates the job was
    /// successfully deleted.
    ///
    /// On the wire: `DELETED`.
    Deleted,
    /// In response to a `release` command, indicates the job was
    /// successfully released back to the ready or delayed states.
    ///
    /// On the wire: `RELEASED`.
    Released,
    /// In response to a `bury`, indicates success.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// In response to a `touch`, indicates the job's TTR was refreshed.
    ///
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to a `watch` or `ignore`, indicates success and the
    /// number of tubes currently watched by the client.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// In response to an `ignore`, indicates the command failed as it
    /// would leave the client with an empty watchlist.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// In response to a `peek`-family command, indicates success.
    ///
    /// On the wire: `FOUND <id> <n_bytes>` plus data.
    Found { id: u64, data: Vec<u8> },
    /// In response to a `kick`, indicates success with the number of jobs
    /// kicked from the buried xor delayed states.
    ///
    /// On the wire: `KICKED <count>`.
    KickedCount { count: u64 },
    /// In response to a `kick-job`, indicates success.
    ///
    /// On the wire: `KICKED`.
    Kicked,
    /// In response to a `stats-job`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
    /// In response to a `stats`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
    /// In response to a `stats-tube`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsTube { data: TubeStats },
    /// In response to a `list-tubes` or `list-tubes-watched`, indicates
    /// success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML *list* format.
    OkListTubes { tubes: Vec<String> },
    /// In response to a `pause-tube`, indicates success.
    ///
    /// On the wire: `PAUSED`.
    Paused,
}

impl Serialisable for Response {
    fn serialise(&self) -> Vec<u8> {
        use Response::*;

        fn yaml_ok<T: Serialize>(data: &T) -> Vec<u8> {
            // Serialising these in-memory stats types cannot fail.
            let data = serde_yaml::to_string(data).unwrap();
            format!("OK {}\r\n{data}\r\n", data.len()).into()
        }

        match self {
            OutOfMemory => b"OUT_OF_MEMORY\r\n".to_vec(),
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => [
                format!("RESERVED {id} {}\r\n", data.len()).into_bytes(),
                data.to_owned(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Found { id, data } => [
                format!("FOUND {id} {}\r\n", data.len()).into_bytes(),
                data.to_owned(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Kicked => b"KICKED\r\n".to_vec(),
            OkStatsJob { data } => yaml_ok(data),
            OkStats { data } => yaml_ok(data),
            OkStatsTube { data } => yaml_ok(data),
            OkListTubes { tubes } => yaml_ok(tubes),
            Paused => b"PAUSED\r\n".to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// tube containing job
    pub tube: String,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: i64,

    /// time in seconds since creation
    pub age: u64,
    /// delay applied by the last put/release
    pub delay: u64,
    /// allowed processing time in seconds
    pub ttr: u64,
    /// seconds until the job leaves the delayed or reserved state
    #[serde(rename = "time-left")]
    pub time_left: u64,

    /// number of times job reserved
    pub reserves: u64,
    /// number of times job timed out
    pub timeouts: u64,
    /// number of times job released
    pub releases: u64,
    /// number of times job buried
    pub buries: u64,
    /// number of times job kicked
    pub kicks: u64,
}

#[derive(Debug, Serialize)]
pub struct TubeStats {
    /// tube name
    pub name: String,
    /// number of jobs in ready state with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients blocked on a `reserve` against this tube
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// cumulative count of reservations that hit their TTR
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    /// number of `delete` commands executed on this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands executed on this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
    /// number of seconds this tube has been paused for in total
    pub pause: u64,
    /// seconds remaining until the tube is un-paused
    #[serde(rename = "pause-time-left")]
    pub pause_time_left: u64,
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    /// number of ready jobs with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in the ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by all clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of delayed jobs
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of buried jobs
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// cumulative count of times a job has timed out
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of currently-existing tubes
    #[serde(rename = "current-tubes")]
    pub current_tubes: u64,
    /// number of clients blocked on a `reserve`
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of seconds since this server process started running
    pub uptime: u64,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
}
