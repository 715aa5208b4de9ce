use crate::C2Action;
use soh_core::OsFamily;
use std::time::Duration;

/// One addressable probe destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub vm: String,
    pub os: OsFamily,
    /// Look the VM up in the client registry by UUID instead of hostname.
    pub id_by_uuid: bool,
}

impl Target {
    #[must_use]
    pub fn new(namespace: impl Into<String>, vm: impl Into<String>, os: OsFamily) -> Self {
        Self {
            namespace: namespace.into(),
            vm: vm.into(),
            os,
            id_by_uuid: false,
        }
    }

    #[must_use]
    pub fn id_by_uuid(mut self, enabled: bool) -> Self {
        self.id_by_uuid = enabled;
        self
    }
}

/// Which part of a command's output a caller reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputChannel {
    /// Untagged output of every stream.
    #[default]
    Both,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct C2Command {
    pub target: Target,
    pub action: C2Action,
    /// File under the substrate's file root, sent before `action` runs.
    pub send_file: Option<String>,
    pub timeout: Duration,
    /// Block in dispatch until the substrate reports a response.
    pub wait: bool,
    pub skip_active_check: bool,
}

impl C2Command {
    #[must_use]
    pub fn new(target: Target, action: C2Action, timeout: Duration) -> Self {
        Self {
            target,
            action,
            send_file: None,
            timeout,
            wait: false,
            skip_active_check: false,
        }
    }

    #[must_use]
    pub fn exec(target: Target, command: impl Into<String>, timeout: Duration) -> Self {
        Self::new(target, C2Action::Exec(command.into()), timeout)
    }

    #[must_use]
    pub fn with_send_file(mut self, file: impl Into<String>) -> Self {
        self.send_file = Some(file.into());
        self
    }

    #[must_use]
    pub fn with_wait(mut self) -> Self {
        self.wait = true;
        self
    }

    #[must_use]
    pub fn skip_active_check(mut self) -> Self {
        self.skip_active_check = true;
        self
    }
}
