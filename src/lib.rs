//! 本地结构化数据文件与远程键值树之间的推送、拉取和实时同步

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{LiveOptions, SyncMode, SyncOptions};
pub use core::{
    run, Collaborators, EngineState, FileKeyMapper, LiveReport, LiveSyncEngine, PullReport,
    PushReport, RemoteKey, RemoteSession, RunOutcome, SyncModeExecutor,
};
pub use error::{FieldError, SyncError};
pub use logging::{ChannelSink, LogConfig, LogRecord, LogSink, TracingSink};
pub use storage::{
    CancelHandle, ChildChange, DefaultConnector, FileSystem, LocalFileSystem, MemoryFileSystem,
    MemoryStore, RemoteConnector, RemoteStore, RestStore, ValueTree,
};
