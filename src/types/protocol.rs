use std::fmt;

use super::attribute::Attribute;

/// Protocol-type constant that opens every frame.
pub const PROTOCOL_TYPE: u32 = 2;
/// Protocol-version constant that follows the protocol type.
pub const PROTOCOL_VERSION: u32 = 2;

/// Kind of per-run output file transferred with a job being executed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileKind {
    StdOut,
    StdErr,
    Checkpoint,
}

impl FileKind {
    pub fn code(self) -> u32 {
        match self {
            FileKind::StdOut => 1,
            FileKind::StdErr => 2,
            FileKind::Checkpoint => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(FileKind::StdOut),
            2 => Some(FileKind::StdErr),
            3 => Some(FileKind::Checkpoint),
            _ => None,
        }
    }

    /// Suffix of the spool file holding this kind of data.
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::StdOut => "OU",
            FileKind::StdErr => "ER",
            FileKind::Checkpoint => "CK",
        }
    }
}

/// A batch request: the authenticated user it is made on behalf of plus the
/// request itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchRequest {
    pub user: String,
    pub body: RequestBody,
}

impl BatchRequest {
    pub fn new(user: impl Into<String>, body: RequestBody) -> Self {
        Self {
            user: user.into(),
            body,
        }
    }
}

/// The closed set of request shapes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestBody {
    /// Opens the transfer of a job. An empty `job_id` asks the receiver to
    /// assign one.
    ///
    /// On the wire: `1 <job_id> <destination> <attrs>`
    QueueJob {
        job_id: String,
        destination: String,
        attrs: Vec<Attribute>,
    },
    /// Credential blob; accepted and ignored.
    ///
    /// On the wire: `2 <cred_type> <data>`
    JobCred { cred_type: u32, data: Vec<u8> },
    /// One chunk of the job script.
    ///
    /// On the wire: `3 <job_id> <seq> <data>`
    JobScript {
        job_id: String,
        seq: u32,
        data: Vec<u8>,
    },
    /// On the wire: `4 <job_id>`
    ReadyToCommit { job_id: String },
    /// On the wire: `5 <job_id>`
    Commit { job_id: String },
    /// On the wire: `6 <job_id>`
    DeleteJob { job_id: String },
    /// On the wire: `7 <job_id> <hold>`
    HoldJob { job_id: String, hold: String },
    /// On the wire: `8 <job_id>`
    LocateJob { job_id: String },
    /// On the wire: `11 <job_id> <attrs>`
    ModifyJob {
        job_id: String,
        attrs: Vec<Attribute>,
    },
    /// On the wire: `12 <job_id> <destination>`
    MoveJob { job_id: String, destination: String },
    /// On the wire: `13 <job_id> <hold>`
    ReleaseJob { job_id: String, hold: String },
    /// On the wire: `14 <job_id>`
    Rerun { job_id: String },
    /// Runs a job, replying once the execution host has committed it. An
    /// empty destination lets the server pick a host.
    ///
    /// On the wire: `15 <job_id> <destination>`
    RunJob { job_id: String, destination: String },
    /// On the wire: `17 <manner>`
    Shutdown { manner: u32 },
    /// On the wire: `18 <job_id> <signal>`
    SignalJob { job_id: String, signal: String },
    /// Status of one job, or every job when `id` is empty.
    ///
    /// On the wire: `19 <id> <attrs>`
    StatusJob { id: String, attrs: Vec<Attribute> },
    /// On the wire: `20 <name>`
    StatusQueue { name: String },
    /// On the wire: `21`
    StatusServer,
    /// As `RunJob`, but replies as soon as the dispatch has been started.
    ///
    /// On the wire: `23 <job_id> <destination>`
    AsyncRunJob { job_id: String, destination: String },
    /// Swaps the queue positions of two jobs.
    ///
    /// On the wire: `50 <job_a> <job_b>`
    OrderJob { job_a: String, job_b: String },
    /// On the wire: `54 <job_id> <files>`
    CopyFiles { job_id: String, files: Vec<String> },
    /// On the wire: `55 <job_id> <files>`
    DelFiles { job_id: String, files: Vec<String> },
    /// Sent by an execution host when a job's processes have ended.
    ///
    /// On the wire: `56 <job_id> <exit_status> <attrs>`
    JobObit {
        job_id: String,
        exit_status: i32,
        attrs: Vec<Attribute>,
    },
    /// One chunk of a per-run file.
    ///
    /// On the wire: `57 <job_id> <kind> <seq> <data>`
    JobFile {
        job_id: String,
        kind: FileKind,
        seq: u32,
        data: Vec<u8>,
    },
    /// On the wire: `58 <name>`
    StatusNode { name: String },
    /// Orderly close of a connection.
    ///
    /// On the wire: `59`
    Disconnect,
}

impl RequestBody {
    /// Discriminant sent on the wire.
    pub fn code(&self) -> i32 {
        use RequestBody::*;

        match self {
            QueueJob { .. } => 1,
            JobCred { .. } => 2,
            JobScript { .. } => 3,
            ReadyToCommit { .. } => 4,
            Commit { .. } => 5,
            DeleteJob { .. } => 6,
            HoldJob { .. } => 7,
            LocateJob { .. } => 8,
            ModifyJob { .. } => 11,
            MoveJob { .. } => 12,
            ReleaseJob { .. } => 13,
            Rerun { .. } => 14,
            RunJob { .. } => 15,
            Shutdown { .. } => 17,
            SignalJob { .. } => 18,
            StatusJob { .. } => 19,
            StatusQueue { .. } => 20,
            StatusServer => 21,
            AsyncRunJob { .. } => 23,
            OrderJob { .. } => 50,
            CopyFiles { .. } => 54,
            DelFiles { .. } => 55,
            JobObit { .. } => 56,
            JobFile { .. } => 57,
            StatusNode { .. } => 58,
            Disconnect => 59,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        use RequestBody::*;

        match self {
            QueueJob { .. } => "QueueJob",
            JobCred { .. } => "JobCred",
            JobScript { .. } => "JobScript",
            ReadyToCommit { .. } => "ReadyToCommit",
            Commit { .. } => "Commit",
            DeleteJob { .. } => "DeleteJob",
            HoldJob { .. } => "HoldJob",
            LocateJob { .. } => "LocateJob",
            ModifyJob { .. } => "ModifyJob",
            MoveJob { .. } => "MoveJob",
            ReleaseJob { .. } => "ReleaseJob",
            Rerun { .. } => "Rerun",
            RunJob { .. } => "RunJob",
            Shutdown { .. } => "Shutdown",
            SignalJob { .. } => "SignalJob",
            StatusJob { .. } => "StatusJob",
            StatusQueue { .. } => "StatusQueue",
            StatusServer => "StatusServer",
            AsyncRunJob { .. } => "AsyncRunJob",
            OrderJob { .. } => "OrderJob",
            CopyFiles { .. } => "CopyFiles",
            DelFiles { .. } => "DelFiles",
            JobObit { .. } => "JobObit",
            JobFile { .. } => "JobFile",
            StatusNode { .. } => "StatusNode",
            Disconnect => "Disconnect",
        }
    }
}

/// Batch error codes carried in every reply header.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCode {
    Ok,
    UnknownJob,
    UnknownRequest,
    PermissionDenied,
    BadHost,
    JobExists,
    System,
    Internal,
    BadState,
    UnknownQueue,
    QueueNotEnabled,
    QueueBusy,
    NoSupport,
    Protocol,
    NoConnects,
    NoServer,
    RouteReject,
    RouteExpired,
    MomReject,
    MaxQueued,
    ExLimit,
    BadAttrValue,
    Timeout,
    /// A code this server does not know, kept verbatim.
    Other(i32),
}

impl ErrorCode {
    const KNOWN: [(ErrorCode, i32); 23] = [
        (ErrorCode::Ok, 0),
        (ErrorCode::UnknownJob, 15001),
        (ErrorCode::UnknownRequest, 15005),
        (ErrorCode::PermissionDenied, 15007),
        (ErrorCode::BadHost, 15008),
        (ErrorCode::JobExists, 15009),
        (ErrorCode::System, 15010),
        (ErrorCode::Internal, 15011),
        (ErrorCode::BadState, 15016),
        (ErrorCode::UnknownQueue, 15018),
        (ErrorCode::QueueNotEnabled, 15021),
        (ErrorCode::QueueBusy, 15027),
        (ErrorCode::NoSupport, 15029),
        (ErrorCode::Protocol, 15031),
        (ErrorCode::NoConnects, 15033),
        (ErrorCode::NoServer, 15034),
        (ErrorCode::RouteReject, 15039),
        (ErrorCode::RouteExpired, 15040),
        (ErrorCode::MomReject, 15041),
        (ErrorCode::MaxQueued, 15046),
        (ErrorCode::ExLimit, 15048),
        (ErrorCode::BadAttrValue, 15014),
        (ErrorCode::Timeout, 15085),
    ];

    pub fn code(self) -> i32 {
        if let ErrorCode::Other(code) = self {
            return code;
        }
        Self::KNOWN
            .iter()
            .find(|(e, _)| *e == self)
            .map(|(_, c)| *c)
            .unwrap_or(-1)
    }

    pub fn from_code(code: i32) -> Self {
        Self::KNOWN
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(e, _)| *e)
            .unwrap_or(ErrorCode::Other(code))
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// Errors a sender may retry after backing off: the peer is up but
    /// temporarily unable to accept the request.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::System
                | ErrorCode::NoConnects
                | ErrorCode::QueueBusy
                | ErrorCode::NoServer
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;

        let text = match self {
            Ok => "no error",
            UnknownJob => "unknown job id",
            UnknownRequest => "unknown request",
            PermissionDenied => "permission denied",
            BadHost => "access from host not allowed",
            JobExists => "job with requested id already exists",
            System => "system error",
            Internal => "internal server error",
            BadState => "request invalid for state of job",
            UnknownQueue => "unknown queue",
            QueueNotEnabled => "queue not enabled",
            QueueBusy => "queue is busy",
            NoSupport => "feature not supported",
            Protocol => "protocol error",
            NoConnects => "no free connections",
            NoServer => "no server to connect to",
            RouteReject => "route rejected by all destinations",
            RouteExpired => "time in route queue expired",
            MomReject => "execution host rejected the job",
            MaxQueued => "maximum number of jobs already in queue",
            ExLimit => "execution limit reached",
            BadAttrValue => "illegal attribute or resource value",
            Timeout => "timed out waiting for peer",
            Other(code) => return write!(f, "error {code}"),
        };
        f.write_str(text)
    }
}

/// One status object: a name and its attributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusEntry {
    pub name: String,
    pub attrs: Vec<Attribute>,
}

/// Reply body shapes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplyBody {
    /// On the wire: `1`
    Null,
    /// Echo of a job id acknowledging QueueJob.
    ///
    /// On the wire: `2 <job_id>`
    Queue(String),
    /// On the wire: `3 <job_id>`
    ReadyToCommit(String),
    /// On the wire: `4 <job_id>`
    Commit(String),
    /// On the wire: `5 <count> <job_id>...`
    Select(Vec<String>),
    /// On the wire: `6 <count> (<name> <attrs>)...`
    Status(Vec<StatusEntry>),
    /// On the wire: `7 <text>`
    Text(String),
    /// On the wire: `8 <destination>`
    Locate(String),
    /// Parallel integer arrays of equal length.
    ///
    /// On the wire: `9 <count> <available>... <allocated>... <reserved>...
    /// <down>...`
    ResourceQuery {
        available: Vec<i32>,
        allocated: Vec<i32>,
        reserved: Vec<i32>,
        down: Vec<i32>,
    },
}

impl ReplyBody {
    pub fn choice(&self) -> i32 {
        match self {
            ReplyBody::Null => 1,
            ReplyBody::Queue(_) => 2,
            ReplyBody::ReadyToCommit(_) => 3,
            ReplyBody::Commit(_) => 4,
            ReplyBody::Select(_) => 5,
            ReplyBody::Status(_) => 6,
            ReplyBody::Text(_) => 7,
            ReplyBody::Locate(_) => 8,
            ReplyBody::ResourceQuery { .. } => 9,
        }
    }
}

/// A batch reply: error code, an auxiliary code (the session id on a
/// successful execution commit) and a body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchReply {
    pub code: ErrorCode,
    pub aux: i32,
    pub body: ReplyBody,
}

impl BatchReply {
    pub fn ok(body: ReplyBody) -> Self {
        Self {
            code: ErrorCode::Ok,
            aux: 0,
            body,
        }
    }

    pub fn null() -> Self {
        Self::ok(ReplyBody::Null)
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            code,
            aux: 0,
            body: ReplyBody::Null,
        }
    }

    pub fn with_aux(mut self, aux: i32) -> Self {
        self.aux = aux;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}
