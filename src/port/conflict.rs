use super::{ProcessController, ProcessInfo};
use crate::error::Error;

/// A port that is already bound, with whatever owners could be identified.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConflict {
    pub port: u16,
    pub processes: Vec<ProcessInfo>,
}

impl PortConflict {
    /// Check whether `port` is in use and, if so, who holds it.
    pub fn check(port: u16, controller: &dyn ProcessController) -> Option<Self> {
        if is_port_available(port) {
            return None;
        }
        Some(PortConflict {
            port,
            processes: controller.find_listeners(port),
        })
    }

    /// First identified owner
    pub fn owner(&self) -> Option<&ProcessInfo> {
        self.processes.first()
    }

    /// " by nginx (PID 1234)", or empty when no owner is known.
    pub fn owner_description(&self) -> String {
        match self.owner() {
            Some(owner) => format!(" by {} (PID {})", owner.name, owner.pid),
            None => String::new(),
        }
    }

    pub fn to_error(&self) -> Error {
        Error::PortConflict {
            port: self.port,
            pid: self.owner().map(|p| p.pid),
            process_name: self.owner().map(|p| p.name.clone()),
        }
    }
}

/// True when the port can be bound on both loopback and all interfaces.
///
/// Binding 127.0.0.1 can succeed on some platforms while 0.0.0.0 is taken,
/// so both are tried. This is a point-in-time answer: another process may
/// bind the port right after.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
        && std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
