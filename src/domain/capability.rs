//! Capability vocabulary shared by agents, the hub and workflow templates

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::MeshError;

/// Capability tag an agent advertises at registration.
///
/// The set is closed: agents cannot invent tags at runtime, so every
/// capability check is a plain set lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    RiskAssessment,
    CollectionsStrategy,
    InvestmentAdvice,
    ComplianceCheck,
    LiquidityManagement,
    CashForecasting,
    PaymentPrioritization,
    ScenarioAnalysis,
    Reporting,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::RiskAssessment,
        Capability::CollectionsStrategy,
        Capability::InvestmentAdvice,
        Capability::ComplianceCheck,
        Capability::LiquidityManagement,
        Capability::CashForecasting,
        Capability::PaymentPrioritization,
        Capability::ScenarioAnalysis,
        Capability::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::RiskAssessment => "risk-assessment",
            Capability::CollectionsStrategy => "collections-strategy",
            Capability::InvestmentAdvice => "investment-advice",
            Capability::ComplianceCheck => "compliance-check",
            Capability::LiquidityManagement => "liquidity-management",
            Capability::CashForecasting => "cash-forecasting",
            Capability::PaymentPrioritization => "payment-prioritization",
            Capability::ScenarioAnalysis => "scenario-analysis",
            Capability::Reporting => "reporting",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = MeshError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        Capability::ALL
            .iter()
            .copied()
            .find(|cap| cap.as_str() == normalized)
            .ok_or_else(|| MeshError::Validation(format!("unknown capability tag '{}'", raw)))
    }
}

/// Ordered capability set
pub type CapabilitySet = BTreeSet<Capability>;

/// Parse a list of raw tags into a capability set, rejecting unknown tags.
pub fn parse_capabilities<I, S>(raw: I) -> Result<CapabilitySet, MeshError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter().map(|tag| tag.as_ref().parse()).collect()
}
