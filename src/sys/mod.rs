// Host collaborators: every subprocess and kernel interface lives behind this module.

pub mod atomic;     // Atomic document writes
pub mod build;      // Script execution + combined output capture
pub mod compose;    // Container orchestration CLI
pub mod git;        // Source control
pub mod net;        // Live TCP socket inspection
pub mod secrets;    // Generated credential hygiene
pub mod systemd;    // Service manager lifecycle
pub mod traits;     // Collaborator contracts
