use crate::SohError;
use std::path::PathBuf;

pub struct SohDirs {
    pub state: PathBuf,
}

impl SohDirs {
    /// Locate the platform state directory for soh.
    ///
    /// # Errors
    /// Returns `SohError::Directory` if the OS state directory cannot be determined.
    pub fn new() -> Result<Self, SohError> {
        let state = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| SohError::Directory("state directory not found".into()))?
            .join("soh");

        Ok(Self { state })
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.state.join("logs")
    }

    #[must_use]
    pub fn status_dir(&self) -> PathBuf {
        self.state.join("status")
    }
}
