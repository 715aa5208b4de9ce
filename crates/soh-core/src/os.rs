use serde::{Deserialize, Serialize};
use std::fmt;

/// Guest operating-system families that probes know how to talk to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    /// Map a free-text topology `os_type` onto a supported family.
    ///
    /// Returns `None` for anything that is not a known Linux or Windows flavour.
    #[must_use]
    pub fn from_os_type(os_type: &str) -> Option<Self> {
        match os_type.to_ascii_lowercase().as_str() {
            "linux" | "rhel" | "centos" => Some(Self::Linux),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_os_type() {
        assert_eq!(OsFamily::from_os_type("linux"), Some(OsFamily::Linux));
        assert_eq!(OsFamily::from_os_type("RHEL"), Some(OsFamily::Linux));
        assert_eq!(OsFamily::from_os_type("centos"), Some(OsFamily::Linux));
        assert_eq!(OsFamily::from_os_type("Windows"), Some(OsFamily::Windows));
        assert_eq!(OsFamily::from_os_type("minirouter"), None);
        assert_eq!(OsFamily::from_os_type(""), None);
    }
}
