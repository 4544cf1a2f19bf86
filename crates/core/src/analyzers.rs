use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::Category;

/// The analyzer entry points. Each one activates a subset of categories and labels the
/// resulting report; the engine itself is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Analyzer {
    AntiAnalysis,
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
    All,
}

impl Analyzer {
    pub const ALL: [Analyzer; 13] = [
        Analyzer::AntiAnalysis,
        Analyzer::C2,
        Analyzer::FileOps,
        Analyzer::Keychain,
        Analyzer::MachIpc,
        Analyzer::Network,
        Analyzer::Persistence,
        Analyzer::PrivilegeEscalation,
        Analyzer::ProcessInjection,
        Analyzer::Rootkit,
        Analyzer::Syscall,
        Analyzer::Xpc,
        Analyzer::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Analyzer::AntiAnalysis => "anti-analysis",
            Analyzer::C2 => "c2",
            Analyzer::FileOps => "file-ops",
            Analyzer::Keychain => "keychain",
            Analyzer::MachIpc => "mach-ipc",
            Analyzer::Network => "network",
            Analyzer::Persistence => "persistence",
            Analyzer::PrivilegeEscalation => "privilege-escalation",
            Analyzer::ProcessInjection => "process-injection",
            Analyzer::Rootkit => "rootkit",
            Analyzer::Syscall => "syscall",
            Analyzer::Xpc => "xpc",
            Analyzer::All => "all",
        }
    }

    /// Categories this analyzer activates, in canonical order.
    pub fn categories(&self) -> Vec<Category> {
        match self {
            Analyzer::AntiAnalysis => vec![Category::AntiDebug],
            Analyzer::C2 => vec![Category::C2],
            Analyzer::FileOps => vec![Category::FileOps],
            Analyzer::Keychain => vec![Category::Keychain],
            Analyzer::MachIpc => vec![Category::MachIpc],
            Analyzer::Network => vec![Category::Network],
            Analyzer::Persistence => vec![Category::Persistence],
            Analyzer::PrivilegeEscalation => vec![Category::PrivilegeEscalation],
            Analyzer::ProcessInjection => vec![Category::ProcessInjection],
            Analyzer::Rootkit => vec![Category::Rootkit],
            Analyzer::Syscall => vec![Category::Syscall],
            Analyzer::Xpc => vec![Category::Xpc],
            Analyzer::All => Category::ALL.to_vec(),
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Analyzer::AntiAnalysis => "Anti-Analysis Detection Report",
            Analyzer::C2 => "C2 Communication Analysis Report",
            Analyzer::FileOps => "File Operation Vulnerability Report",
            Analyzer::Keychain => "Keychain & Credential Analysis Report",
            Analyzer::MachIpc => "Mach IPC Analysis Report",
            Analyzer::Network => "Network Activity Report",
            Analyzer::Persistence => "Persistence Mechanism Report",
            Analyzer::PrivilegeEscalation => "Privilege Escalation Analysis Report",
            Analyzer::ProcessInjection => "Process Injection Analysis Report",
            Analyzer::Rootkit => "Rootkit Behavior Report",
            Analyzer::Syscall => "Raw Syscall Analysis Report",
            Analyzer::Xpc => "XPC Service Analysis Report",
            Analyzer::All => "Full Technique Scan Report",
        }
    }
}

impl fmt::Display for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Analyzer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        // Category identifiers are accepted as aliases ("anti-debug" for "anti-analysis").
        if let Some(found) = Analyzer::ALL.iter().find(|a| a.as_str() == wanted) {
            return Ok(*found);
        }
        match wanted.parse::<Category>() {
            Ok(Category::AntiDebug) => Ok(Analyzer::AntiAnalysis),
            Ok(_) => Err(format!("unknown analyzer '{s}'")),
            Err(_) => {
                let names: Vec<&str> = Analyzer::ALL.iter().map(|a| a.as_str()).collect();
                Err(format!("unknown analyzer '{s}' (expected one of: {})", names.join(", ")))
            }
        }
    }
}
