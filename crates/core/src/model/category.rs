use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Technique domain a signature, rule, or finding belongs to.
///
/// Declaration order is the canonical report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    AntiDebug,
    C2,
    FileOps,
    Keychain,
    MachIpc,
    Network,
    Persistence,
    PrivilegeEscalation,
    ProcessInjection,
    Rootkit,
    Syscall,
    Xpc,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::AntiDebug,
        Category::C2,
        Category::FileOps,
        Category::Keychain,
        Category::MachIpc,
        Category::Network,
        Category::Persistence,
        Category::PrivilegeEscalation,
        Category::ProcessInjection,
        Category::Rootkit,
        Category::Syscall,
        Category::Xpc,
    ];

    /// Stable identifier used in catalogues, config files, and JSON output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::AntiDebug => "anti-debug",
            Category::C2 => "c2",
            Category::FileOps => "file-ops",
            Category::Keychain => "keychain",
            Category::MachIpc => "mach-ipc",
            Category::Network => "network",
            Category::Persistence => "persistence",
            Category::PrivilegeEscalation => "privilege-escalation",
            Category::ProcessInjection => "process-injection",
            Category::Rootkit => "rootkit",
            Category::Syscall => "syscall",
            Category::Xpc => "xpc",
        }
    }

    /// Human-friendly heading for console reports.
    pub fn label(&self) -> &'static str {
        match self {
            Category::AntiDebug => "Anti-Debugging / Anti-Analysis",
            Category::C2 => "Command & Control",
            Category::FileOps => "File Operation Vulnerabilities",
            Category::Keychain => "Keychain & Credentials",
            Category::MachIpc => "Mach IPC",
            Category::Network => "Networking",
            Category::Persistence => "Persistence",
            Category::PrivilegeEscalation => "Privilege Escalation",
            Category::ProcessInjection => "Process Injection",
            Category::Rootkit => "Rootkit Behavior",
            Category::Syscall => "Raw System Calls",
            Category::Xpc => "XPC",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}
