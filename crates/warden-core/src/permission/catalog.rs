//! Static classification of engine tool names by risk.

use serde::{Deserialize, Serialize};
use strum::Display;

const CONTROLLED_TOOLS: &[&str] = &[
    // File system
    "Write",
    "Edit",
    "Delete",
    "CreateDirectory",
    "MoveFile",
    "CopyFile",
    "Rename",
    // Command execution
    "Bash",
    "ExecuteCommand",
    "RunCode",
    "SystemCommand",
    // Packages
    "InstallPackage",
    "UninstallPackage",
    "UpdatePackage",
    // Network
    "HttpRequest",
    "Download",
    "Upload",
    // Version control
    "GitCommit",
    "GitPush",
    "GitPull",
    "GitMerge",
    "GitCheckout",
    // Databases
    "DatabaseQuery",
    "DatabaseUpdate",
    "DatabaseDelete",
];

const HIGH_RISK_TOOLS: &[&str] = &[
    "Delete",
    "DatabaseDelete",
    "GitPush",
    "SystemCommand",
    "UninstallPackage",
];

const SAFE_TOOLS: &[&str] = &["Read", "List", "Search", "Grep", "Find"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Unknown,
    Controlled,
    High,
}

/// Classifies tool names into safe, controlled and high-risk sets.
///
/// Names outside every set are `Unknown`; the broker still arbitrates them,
/// the level only informs how the host presents the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolRiskCatalog;

impl ToolRiskCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn requires_permission(&self, tool_name: &str) -> bool {
        CONTROLLED_TOOLS.contains(&tool_name)
    }

    pub fn is_high_risk(&self, tool_name: &str) -> bool {
        HIGH_RISK_TOOLS.contains(&tool_name)
    }

    pub fn is_safe(&self, tool_name: &str) -> bool {
        SAFE_TOOLS.contains(&tool_name)
    }

    pub fn risk_level(&self, tool_name: &str) -> RiskLevel {
        if self.is_high_risk(tool_name) {
            RiskLevel::High
        } else if self.requires_permission(tool_name) {
            RiskLevel::Controlled
        } else if self.is_safe(tool_name) {
            RiskLevel::Safe
        } else {
            RiskLevel::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_risk_tools_are_controlled() {
        let catalog = ToolRiskCatalog::new();
        for tool in HIGH_RISK_TOOLS {
            assert!(catalog.requires_permission(tool), "{tool} must be controlled");
        }
    }

    #[test]
    fn test_risk_levels() {
        let catalog = ToolRiskCatalog::new();
        assert_eq!(catalog.risk_level("GitPush"), RiskLevel::High);
        assert_eq!(catalog.risk_level("Edit"), RiskLevel::Controlled);
        assert_eq!(catalog.risk_level("Grep"), RiskLevel::Safe);
        assert_eq!(catalog.risk_level("WebFetch"), RiskLevel::Unknown);
        assert!(RiskLevel::High > RiskLevel::Controlled);
    }
}
