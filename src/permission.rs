// src/permission.rs
use log::{info, warn};
use serde::Deserialize;

/// How the desktop build answers the camera permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Granted,
    Denied,
    /// Ask the user through an in-app dialog.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    NotGranted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Resolved(bool),
    /// The answer arrives later through [`PermissionGate::on_request_result`].
    Pending,
}

pub trait PermissionProvider {
    fn check(&self) -> PermissionStatus;
    fn request(&mut self) -> RequestOutcome;
}

impl PermissionProvider for PermissionMode {
    fn check(&self) -> PermissionStatus {
        match self {
            PermissionMode::Granted => PermissionStatus::Granted,
            PermissionMode::Denied | PermissionMode::Prompt => PermissionStatus::NotGranted,
        }
    }

    fn request(&mut self) -> RequestOutcome {
        match self {
            PermissionMode::Granted => RequestOutcome::Resolved(true),
            PermissionMode::Denied => RequestOutcome::Resolved(false),
            PermissionMode::Prompt => RequestOutcome::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    AwaitingPermission,
    Prompting,
    Capturing,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    StartCapture,
    ShowPrompt,
    NotifyDenied,
}

/// Tracks the camera permission flow so capture starts at most once and a
/// denial is reported at most once.
#[derive(Debug)]
pub struct PermissionGate {
    state: GateState,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self {
            state: GateState::AwaitingPermission,
        }
    }
}

impl PermissionGate {
    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn start(&mut self, provider: &mut dyn PermissionProvider) -> Option<GateAction> {
        if self.state != GateState::AwaitingPermission {
            return None;
        }
        if provider.check() == PermissionStatus::Granted {
            info!("Camera permission already granted.");
            self.state = GateState::Capturing;
            return Some(GateAction::StartCapture);
        }
        info!("Requesting camera permission.");
        self.state = GateState::Prompting;
        match provider.request() {
            RequestOutcome::Resolved(granted) => self.on_request_result(granted),
            RequestOutcome::Pending => Some(GateAction::ShowPrompt),
        }
    }

    pub fn on_request_result(&mut self, granted: bool) -> Option<GateAction> {
        if self.state != GateState::Prompting {
            return None;
        }
        if granted {
            info!("Camera permission granted.");
            self.state = GateState::Capturing;
            Some(GateAction::StartCapture)
        } else {
            warn!("Camera permission denied; capture will not start.");
            self.state = GateState::Denied;
            Some(GateAction::NotifyDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(actions: &[Option<GateAction>], wanted: GateAction) -> usize {
        actions.iter().filter(|a| **a == Some(wanted)).count()
    }

    #[test]
    fn granted_starts_capture_once() {
        let mut gate = PermissionGate::default();
        let mut mode = PermissionMode::Granted;
        let actions = vec![
            gate.start(&mut mode),
            gate.start(&mut mode),
            gate.on_request_result(true),
        ];
        assert_eq!(count(&actions, GateAction::StartCapture), 1);
        assert_eq!(gate.state(), GateState::Capturing);
    }

    #[test]
    fn denial_notifies_once_and_never_captures() {
        let mut gate = PermissionGate::default();
        let mut mode = PermissionMode::Denied;
        let actions = vec![
            gate.start(&mut mode),
            gate.start(&mut mode),
            gate.on_request_result(false),
            gate.on_request_result(true),
        ];
        assert_eq!(count(&actions, GateAction::NotifyDenied), 1);
        assert_eq!(count(&actions, GateAction::StartCapture), 0);
        assert_eq!(gate.state(), GateState::Denied);
    }

    #[test]
    fn prompt_waits_for_answer() {
        let mut gate = PermissionGate::default();
        let mut mode = PermissionMode::Prompt;
        assert_eq!(gate.start(&mut mode), Some(GateAction::ShowPrompt));
        assert_eq!(gate.state(), GateState::Prompting);
        assert_eq!(gate.on_request_result(true), Some(GateAction::StartCapture));
        assert_eq!(gate.on_request_result(true), None);
        assert_eq!(gate.state(), GateState::Capturing);
    }

    #[test]
    fn prompt_denied_reports_once() {
        let mut gate = PermissionGate::default();
        let mut mode = PermissionMode::Prompt;
        gate.start(&mut mode);
        assert_eq!(gate.on_request_result(false), Some(GateAction::NotifyDenied));
        assert_eq!(gate.on_request_result(false), None);
    }
}
