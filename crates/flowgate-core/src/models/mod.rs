pub mod event;
pub mod file;
pub mod principal;
pub mod session;

pub use event::StreamEvent;
pub use file::{FileRecord, FileReport, FileStatus, FilesSummary};
pub use principal::Principal;
pub use session::{SandboxHandle, Session, SessionOverview, SessionStatus};
