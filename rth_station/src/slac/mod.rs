//! Powerline link establishment. The actual SLAC matching runs in an
//! external tool (open-plc-utils); this module shells out to it and
//! reports success by exit status.

use std::process::Command;

use crate::data_io::config::{DeviceRole, SlacConfig};

/// Seam between the orchestrator and the powerline modem. Production runs
/// the configured external tool; tests script the outcomes.
pub trait PlcLink {
    /// Prepare the link for the given role. Must succeed before `connect`.
    fn init(&mut self, role: DeviceRole) -> bool;
    /// Run the matching sequence; true once the link is up.
    fn connect(&mut self) -> bool;
    fn close(&mut self);
}

pub struct SlacTool {
    config: SlacConfig,
    command: Option<String>,
}

impl SlacTool {
    pub fn new(config: SlacConfig) -> Self {
        Self {
            config,
            command: None,
        }
    }
}

impl PlcLink for SlacTool {
    fn init(&mut self, role: DeviceRole) -> bool {
        let command = match role {
            DeviceRole::Ev => self.config.ev_command.clone(),
            DeviceRole::Evse => self.config.evse_command.clone(),
        };
        if command.split_whitespace().next().is_none() {
            log::error!("No SLAC command configured for {role}");
            return false;
        }
        log::info!("SLAC tool for {role}: {command}");
        self.command = Some(command);
        true
    }

    fn connect(&mut self) -> bool {
        let Some(command) = &self.command else {
            log::error!("SLAC connect before init");
            return false;
        };
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap();
        match Command::new(program).args(parts).status() {
            Ok(status) if status.success() => {
                log::info!("SLAC matching complete");
                true
            }
            Ok(status) => {
                log::error!("SLAC tool exited with {status}");
                false
            }
            Err(e) => {
                log::error!("SLAC tool failed to start {e:?}");
                false
            }
        }
    }

    fn close(&mut self) {
        self.command = None;
    }
}
