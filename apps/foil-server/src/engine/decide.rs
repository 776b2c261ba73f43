use serde::{Deserialize, Serialize};

use foil_policy::Verdict;

use crate::util::env_f64;

/// Parsed output of a drafting provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftOutcome {
    pub action_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub fee_amount: Option<f64>,
}

/// Knobs a replay may override without touching stored state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default)]
    pub autopilot_mode: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub fee_limit: Option<f64>,
    #[serde(default)]
    pub action_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    AutoExecute,
    RequireHuman { pause_reason: String },
    Blocked { violations: Vec<String> },
}

impl Disposition {
    pub fn pause_reason(&self) -> Option<&str> {
        match self {
            Disposition::RequireHuman { pause_reason } => Some(pause_reason),
            Disposition::Blocked { .. } => Some("policy_blocked"),
            Disposition::AutoExecute => None,
        }
    }
}

pub(crate) fn auto_confidence_min() -> f64 {
    env_f64("FOIL_AUTO_CONFIDENCE_MIN", 0.75)
}

pub(crate) fn fee_auto_limit() -> f64 {
    env_f64("FOIL_FEE_AUTO_LIMIT", 25.0)
}

/// Pure routing decision for a drafted action: execute on autopilot, park it
/// for a human, or block it outright. Policy verdicts always win.
pub fn disposition(
    autopilot_mode: &str,
    draft: &DraftOutcome,
    verdict: &Verdict,
    overrides: &Overrides,
) -> Disposition {
    if verdict.blocked {
        return Disposition::Blocked {
            violations: verdict.violations.clone(),
        };
    }
    let mode = overrides
        .autopilot_mode
        .as_deref()
        .unwrap_or(autopilot_mode);
    match mode {
        "manual" => {
            return Disposition::RequireHuman {
                pause_reason: "manual_mode".into(),
            }
        }
        "auto" => {}
        // Unknown modes fall back to supervised.
        _ => {
            return Disposition::RequireHuman {
                pause_reason: "awaiting_approval".into(),
            }
        }
    }
    let confidence = overrides.confidence.unwrap_or(draft.confidence);
    if confidence < auto_confidence_min() {
        return Disposition::RequireHuman {
            pause_reason: "low_confidence".into(),
        };
    }
    if !draft.risk_flags.is_empty() {
        return Disposition::RequireHuman {
            pause_reason: "risk_flags".into(),
        };
    }
    let fee_limit = overrides.fee_limit.unwrap_or_else(fee_auto_limit);
    if draft.fee_amount.unwrap_or(0.0) > fee_limit {
        return Disposition::RequireHuman {
            pause_reason: "fee_review".into(),
        };
    }
    Disposition::AutoExecute
}
