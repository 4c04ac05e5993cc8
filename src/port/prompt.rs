use crate::port::PortConflict;
use std::io::{stderr, stdin, Write};

/// What the user chose to do about a port conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Kill the owning process tree this time
    Kill,
    /// Kill, and remember to always kill from now on
    AlwaysKill,
    /// Use a different port
    Reassign,
    Cancel,
}

/// Asks someone how to resolve a conflict.
pub trait ConflictPrompt: Send + Sync {
    /// `None` when there is nobody to ask.
    fn ask(&self, service: &str, conflict: &PortConflict) -> Option<ConflictDecision>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl ConflictPrompt for TerminalPrompt {
    fn ask(&self, service: &str, conflict: &PortConflict) -> Option<ConflictDecision> {
        if !is_interactive() {
            tracing::debug!(
                "Not prompting about port {} for '{}': session is not interactive",
                conflict.port,
                service
            );
            return None;
        }
        Some(prompt_user(service, conflict))
    }
}

/// Always gives the same answer. `StaticPrompt(None)` behaves like a
/// session without a terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPrompt(pub Option<ConflictDecision>);

impl ConflictPrompt for StaticPrompt {
    fn ask(&self, _service: &str, _conflict: &PortConflict) -> Option<ConflictDecision> {
        self.0
    }
}

/// Check if running in interactive TTY
pub fn is_interactive() -> bool {
    use std::io::IsTerminal;
    if std::env::var_os("STACKUP_NON_INTERACTIVE").is_some() {
        return false;
    }
    // Cargo test binaries run from target/*/deps/ and are never interactive
    if let Ok(exe) = std::env::current_exe() {
        if let Some(path) = exe.to_str() {
            if path.contains("/deps/") || path.contains("\\deps\\") {
                return false;
            }
        }
    }
    stdin().is_terminal() && stderr().is_terminal()
}

fn prompt_user(service: &str, conflict: &PortConflict) -> ConflictDecision {
    let mut err = stderr();
    let _ = writeln!(err);
    let _ = writeln!(
        err,
        "⚠️  Service '{}' needs port {}, which is in use{}",
        service,
        conflict.port,
        conflict.owner_description()
    );
    for process in conflict.processes.iter().skip(1) {
        let _ = writeln!(err, "   also held by {} (PID {})", process.name, process.pid);
    }
    let _ = writeln!(err);
    let _ = writeln!(err, "Options:");
    let _ = writeln!(err, "  [1/k] Kill the process using port {}", conflict.port);
    let _ = writeln!(err, "  [2/r] Assign a different port automatically");
    let _ = writeln!(err, "  [3/q] Cancel");
    let _ = writeln!(err, "  [4/a] Always kill processes (don't ask again)");
    let _ = write!(err, "Your choice: ");
    let _ = err.flush();

    loop {
        use crossterm::event::{read, Event, KeyCode, KeyEvent};

        match read() {
            Ok(Event::Key(KeyEvent { code, .. })) => {
                let decision = match code {
                    KeyCode::Char('1' | 'k' | 'K') => ConflictDecision::Kill,
                    KeyCode::Char('2' | 'r' | 'R') => ConflictDecision::Reassign,
                    KeyCode::Char('3' | 'q' | 'Q') | KeyCode::Esc => ConflictDecision::Cancel,
                    KeyCode::Char('4' | 'a' | 'A') => ConflictDecision::AlwaysKill,
                    // Invalid input, keep waiting
                    _ => continue,
                };
                let _ = writeln!(err);
                return decision;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to read prompt answer: {}", e);
                return ConflictDecision::Cancel;
            }
        }
    }
}
