pub mod error;
pub mod orchestrator;
pub mod pinning;
pub mod report;
pub mod signaling;
pub mod step;

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bitcoin_client::Ledger;

pub use error::ScenarioError;
pub use orchestrator::Orchestrator;
pub use pinning::{PinningScenario, PinningState, PinningVariant};
pub use report::{Outcome, Report};
pub use signaling::InheritedSignalingScenario;
pub use step::ScenarioStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    AbsoluteFee,
    NoOptIn,
    InheritedSignaling,
    All,
}

impl ScenarioKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::AbsoluteFee => "absolute-fee",
            ScenarioKind::NoOptIn => "no-opt-in",
            ScenarioKind::InheritedSignaling => "inherited-signaling",
            ScenarioKind::All => "all",
        }
    }

    /// Concrete scenarios, in run order.
    pub fn expand(self) -> Vec<ScenarioKind> {
        match self {
            ScenarioKind::All => vec![
                ScenarioKind::AbsoluteFee,
                ScenarioKind::NoOptIn,
                ScenarioKind::InheritedSignaling,
            ],
            kind => vec![kind],
        }
    }
}

/// Runs one concrete scenario and returns its report with the outcome.
pub async fn run_scenario<L: Ledger>(
    kind: ScenarioKind,
    nodes: Vec<L>,
    cancel_token: CancellationToken,
    rpc_retries: usize,
    sync_timeout: Duration,
) -> (Report, Result<(), ScenarioError>) {
    let orchestrator = Orchestrator::new(
        kind.name(),
        nodes,
        cancel_token,
        rpc_retries,
        sync_timeout,
    );
    let (orchestrator, result) = match kind {
        ScenarioKind::AbsoluteFee | ScenarioKind::NoOptIn => {
            let variant = if kind == ScenarioKind::AbsoluteFee {
                PinningVariant::AbsoluteFee
            } else {
                PinningVariant::NoOptIn
            };
            let mut scenario = PinningScenario::new(variant, orchestrator);
            let result = scenario.run().await;
            (scenario.into_orchestrator(), result)
        }
        ScenarioKind::InheritedSignaling => {
            let mut scenario = InheritedSignalingScenario::new(orchestrator);
            let result = scenario.run().await;
            (scenario.into_orchestrator(), result)
        }
        ScenarioKind::All => (orchestrator, Ok(())),
    };
    match &result {
        Ok(()) => info!(scenario = kind.name(), "Scenario passed"),
        Err(e) => error!(scenario = kind.name(), "Scenario failed: {}", e),
    }
    (orchestrator.into_report(), result)
}

/// Runs every scenario `kind` expands to, stopping at the first failure.
pub async fn run_scenarios<L: Ledger>(
    kind: ScenarioKind,
    nodes: Vec<L>,
    cancel_token: CancellationToken,
    rpc_retries: usize,
    sync_timeout: Duration,
) -> (Vec<Report>, Result<(), ScenarioError>) {
    let mut reports = vec![];
    for kind in kind.expand() {
        let (report, result) = run_scenario(
            kind,
            nodes.clone(),
            cancel_token.clone(),
            rpc_retries,
            sync_timeout,
        )
        .await;
        reports.push(report);
        if result.is_err() {
            return (reports, result);
        }
    }
    (reports, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_all() {
        assert_eq!(ScenarioKind::All.expand().len(), 3);
        assert_eq!(
            ScenarioKind::NoOptIn.expand(),
            vec![ScenarioKind::NoOptIn]
        );
        assert_eq!(
            ScenarioKind::from_str("inherited-signaling", true).unwrap(),
            ScenarioKind::InheritedSignaling
        );
    }
}
