/// Postgres wire protocol message type tag bytes, trimmed to the ones the
/// relay actually inspects. Most message bodies pass through unparsed; we
/// only need to recognize the handful of tags that drive pooling decisions
/// (session pins, transaction boundaries, auth, errors).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Tag(pub u8);

impl Tag {
    // Frontend
    pub const BIND: Tag = Tag(b'B');
    pub const CLOSE: Tag = Tag(b'C');
    pub const DESCRIBE: Tag = Tag(b'D');
    pub const EXECUTE: Tag = Tag(b'E');
    pub const PARSE: Tag = Tag(b'P');
    pub const PASSWORD_MESSAGE: Tag = Tag(b'p');
    pub const QUERY: Tag = Tag(b'Q');
    pub const SYNC: Tag = Tag(b'S');
    pub const TERMINATE: Tag = Tag(b'X');
    pub const FUNCTION_CALL: Tag = Tag(b'F');
    pub const COPY_DATA: Tag = Tag(b'd');
    pub const COPY_DONE: Tag = Tag(b'c');
    pub const COPY_FAIL: Tag = Tag(b'f');
    pub const FLUSH: Tag = Tag(b'H');

    // Backend
    pub const AUTHENTICATION: Tag = Tag(b'R');
    pub const BACKEND_KEY_DATA: Tag = Tag(b'K');
    pub const PARAMETER_STATUS: Tag = Tag(b'S');
    pub const READY_FOR_QUERY: Tag = Tag(b'Z');
    pub const ERROR_RESPONSE: Tag = Tag(b'E');
    pub const NOTICE_RESPONSE: Tag = Tag(b'N');
    pub const COMMAND_COMPLETE: Tag = Tag(b'C');
    pub const NOTIFICATION_RESPONSE: Tag = Tag(b'A');

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// `ReadyForQuery`'s single payload byte: transaction status indicator.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InFailedTransaction,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::InFailedTransaction),
            _ => None,
        }
    }
}

pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
pub const PROTOCOL_VERSION_3: i32 = 196608;

pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_NOT_ALLOWED: u8 = b'N';
