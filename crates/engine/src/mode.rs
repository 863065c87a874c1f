//! Demo / live mode gate shared by every view

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::credentials::{CredentialSet, CredentialSummary};

#[derive(Debug, Clone)]
pub struct ModeState {
    pub demo_mode: bool,
    /// Set once a live connection test has succeeded
    pub can_disable_demo: bool,
    pub active_credentials: Option<CredentialSet>,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            demo_mode: true,
            can_disable_demo: false,
            active_credentials: None,
        }
    }
}

/// Redacted view of [`ModeState`] for outer layers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeView {
    pub demo_mode: bool,
    pub can_disable_demo: bool,
    pub active_credentials: Option<CredentialSummary>,
}

impl From<&ModeState> for ModeView {
    fn from(state: &ModeState) -> Self {
        Self {
            demo_mode: state.demo_mode,
            can_disable_demo: state.can_disable_demo,
            active_credentials: state.active_credentials.as_ref().map(CredentialSet::summary),
        }
    }
}

/// Single owner of [`ModeState`]; clones share it. Readers subscribe.
#[derive(Clone)]
pub struct ModeController {
    tx: Arc<watch::Sender<ModeState>>,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ModeState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn is_demo_mode(&self) -> bool {
        self.tx.borrow().demo_mode
    }

    pub fn can_disable_demo(&self) -> bool {
        self.tx.borrow().can_disable_demo
    }

    pub fn snapshot(&self) -> ModeState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        self.tx.subscribe()
    }

    /// Revoking permission also puts the system back into demo mode
    pub fn set_can_disable_demo(&self, allowed: bool) {
        self.tx.send_if_modified(|state| {
            let mut changed = state.can_disable_demo != allowed;
            state.can_disable_demo = allowed;
            if !allowed && !state.demo_mode {
                state.demo_mode = true;
                changed = true;
            }
            changed
        });
    }

    /// Flip demo mode; does nothing until live mode has been unlocked.
    /// Returns the demo flag after the call.
    pub fn toggle_demo_mode(&self) -> bool {
        let mut demo = true;
        let toggled = self.tx.send_if_modified(|state| {
            if !state.can_disable_demo {
                demo = state.demo_mode;
                return false;
            }
            state.demo_mode = !state.demo_mode;
            demo = state.demo_mode;
            true
        });
        if toggled {
            info!(demo_mode = demo, "Demo mode toggled");
        } else {
            debug!("Demo mode toggle ignored, live mode is locked");
        }
        demo
    }

    /// Subscribers are notified only when the active set id changes
    pub fn set_active_credentials(&self, credentials: Option<CredentialSet>) {
        self.tx.send_if_modified(|state| {
            let before = state.active_credentials.as_ref().map(|c| c.id.clone());
            let after = credentials.as_ref().map(|c| c.id.clone());
            state.active_credentials = credentials;
            before != after
        });
    }
}
