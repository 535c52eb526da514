pub mod echo;
pub mod executor;
pub mod live;
pub mod mapper;
pub mod session;
pub mod validator;

pub use echo::{digest, Direction, EchoGuard};
pub use executor::{
    pull_target, run, Collaborators, PullReport, PushReport, RunOutcome, SyncModeExecutor,
};
pub use live::{EngineState, LiveReport, LiveSyncEngine};
pub use mapper::{FileKeyMapper, RemoteKey};
pub use session::RemoteSession;
pub use validator::validate_options;
