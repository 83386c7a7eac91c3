// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Engine-level error. Every variant except `Sql` and `Io` maps 1:1 onto a
/// wire-level MAPI result code; the RPC layer converts with [`StoreError::code`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object does not exist")]
    NullObject,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("access denied")]
    AccessDenied,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("duplicate name")]
    DuplicateName,
    #[error("not found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("no permission to log on")]
    LoginPerm,
    #[error("logon failure")]
    LoginFailure,
    #[error("wrong server")]
    WrongServer,
    /// Upload carries a change the store already knows about.
    #[error("sync: change already included")]
    SyncIgnore,
    /// PCL comparison found divergent histories and the caller asked to fail.
    #[error("sync: conflicting change")]
    SyncConflict,
    #[error("sync: client change newer")]
    SyncClientChangeNewer,

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("blob store error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level result codes, in the order the protocol defines them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0x0000_0000,
    NullObject = 0x0000_04B9,
    NotSupported = 0x8004_0102,
    InvalidParam = 0x8007_0057,
    AccessDenied = 0x8007_0005,
    QuotaExceeded = 0x8004_060C,
    DuplicateName = 0x8004_0604,
    NotFound = 0x8004_010F,
    OutOfMemory = 0x8007_000E,
    BufferTooSmall = 0x0000_047D,
    LoginPerm = 0x8004_0111,
    LoginFailure = 0x8004_0112,
    WrongServer = 0x0000_0478,
    SyncIgnore = 0x0000_0402,
    SyncConflict = 0x8004_0802,
    SyncClientChangeNewer = 0x8004_0806,
    CallFailed = 0x8000_4005,
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NullObject => ErrorCode::NullObject,
            StoreError::NotSupported => ErrorCode::NotSupported,
            StoreError::InvalidParam(_) => ErrorCode::InvalidParam,
            StoreError::AccessDenied => ErrorCode::AccessDenied,
            StoreError::QuotaExceeded => ErrorCode::QuotaExceeded,
            StoreError::DuplicateName => ErrorCode::DuplicateName,
            StoreError::NotFound => ErrorCode::NotFound,
            StoreError::OutOfMemory => ErrorCode::OutOfMemory,
            StoreError::BufferTooSmall => ErrorCode::BufferTooSmall,
            StoreError::LoginPerm => ErrorCode::LoginPerm,
            StoreError::LoginFailure => ErrorCode::LoginFailure,
            StoreError::WrongServer => ErrorCode::WrongServer,
            StoreError::SyncIgnore => ErrorCode::SyncIgnore,
            StoreError::SyncConflict => ErrorCode::SyncConflict,
            StoreError::SyncClientChangeNewer => ErrorCode::SyncClientChangeNewer,
            StoreError::Sql(_) | StoreError::Io(_) => ErrorCode::CallFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
