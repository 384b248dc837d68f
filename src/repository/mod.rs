pub mod recordings;
pub mod session_logs;
pub mod stream_sessions;

pub use recordings::RecordingRepository;
pub use session_logs::SessionLogRepository;
pub use stream_sessions::StreamSessionRepository;
