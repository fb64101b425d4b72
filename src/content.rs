use std::path::{Path, PathBuf};

use crate::{error::ClientError, Session};

lazy_static::lazy_static! {
    static ref STORE: ContentStore = ContentStore::default();
}

pub fn get_latest_session() -> Option<Session> {
    STORE.latest_session()
}

pub fn put_session(session: &Session) {
    STORE.put_session(session)
}

pub fn delete_latest_session() {
    STORE.delete_latest_session()
}

pub const SESSIONS_DIR_NAME: &str = "sessions";
pub const LOG_FILENAME: &str = "log";

/// On-disk locations for client state that survives restarts: the latest
/// session and the log file.
#[derive(Debug, Clone)]
pub struct ContentStore {
    latest_session_file: PathBuf,
    sessions_dir: PathBuf,
    log_file: PathBuf,
}

impl Default for ContentStore {
    fn default() -> Self {
        let (sessions_dir, log_file) =
            match directories_next::ProjectDirs::from("app", "chorus", "chorus") {
                Some(app_dirs) => (
                    app_dirs.data_dir().join(SESSIONS_DIR_NAME),
                    app_dirs.data_dir().join(LOG_FILENAME),
                ),
                // Fallback to current working directory if no HOME is present
                None => (SESSIONS_DIR_NAME.into(), LOG_FILENAME.into()),
            };

        Self {
            latest_session_file: sessions_dir.join("latest"),
            sessions_dir,
            log_file,
        }
    }
}

impl ContentStore {
    /// A store rooted at an explicit directory instead of the platform
    /// data dir.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let sessions_dir = base.join(SESSIONS_DIR_NAME);
        Self {
            latest_session_file: sessions_dir.join("latest"),
            sessions_dir,
            log_file: base.join(LOG_FILENAME),
        }
    }

    pub fn latest_session(&self) -> Option<Session> {
        let raw = std::fs::read_to_string(self.latest_session_file()).ok()?;
        toml::from_str::<Session>(&raw)
            .map_err(|err| ClientError::Custom(err.to_string()))
            .ok()
    }

    pub fn put_session(&self, session: &Session) {
        let serialized = toml::to_string_pretty(session).expect("failed to serialize");
        let _ = std::fs::write(self.latest_session_file(), serialized.into_bytes());
    }

    pub fn delete_latest_session(&self) {
        let _ = std::fs::remove_file(self.latest_session_file());
    }

    pub fn create_req_dirs(&self) -> Result<(), ClientError> {
        use std::fs::create_dir_all;

        create_dir_all(self.sessions_dir())?;
        create_dir_all(self.log_file().parent().unwrap_or_else(|| Path::new(".")))?;

        Ok(())
    }

    pub fn latest_session_file(&self) -> &Path {
        self.latest_session_file.as_path()
    }

    pub fn sessions_dir(&self) -> &Path {
        self.sessions_dir.as_path()
    }

    pub fn log_file(&self) -> &Path {
        self.log_file.as_path()
    }
}
