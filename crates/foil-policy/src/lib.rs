use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;

/// One declarative gate applied to outbound proposals.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum PolicyRule {
    /// Block when the estimated fee exceeds the limit (dollars).
    MaxFee { limit: f64 },
    /// Block proposals carrying any of these risk flags.
    RiskFlag { flags: Vec<String> },
    /// Block the listed action types outright (human must send manually).
    DenyAction { action_types: Vec<String> },
    /// Block auto-execution below this confidence; human review still allowed.
    MinConfidence { floor: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allow_all: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_all: false,
            rules: vec![
                PolicyRule::RiskFlag {
                    flags: vec!["legal_threat".into(), "fee_dispute".into()],
                },
                PolicyRule::MaxFee { limit: 100.0 },
            ],
        }
    }
}

/// Outcome of validating a proposal against the active rule set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub blocked: bool,
    #[serde(default)]
    pub violations: Vec<String>,
}

impl Verdict {
    pub fn clean() -> Self {
        Self {
            blocked: false,
            violations: vec![],
        }
    }
}

/// What the engine hands the validator: the proposal fields policy can see
/// plus the case context that scopes them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalView {
    pub case_id: String,
    pub action_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub fee_amount: Option<f64>,
    #[serde(default)]
    pub autopilot_mode: String,
}

#[derive(Clone, Debug)]
pub struct PolicyEngine {
    cfg: PolicyConfig,
}

impl PolicyEngine {
    pub fn with_config(cfg: PolicyConfig) -> Self {
        Self { cfg }
    }

    /// Highest precedence: explicit JSON file via FOIL_POLICY_FILE, then the
    /// FOIL_POLICY_ALLOW_ALL escape hatch, then built-in defaults.
    pub fn load_from_env() -> Self {
        if let Ok(path) = std::env::var("FOIL_POLICY_FILE") {
            match fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|b| serde_json::from_slice::<PolicyConfig>(&b).map_err(Into::into))
            {
                Ok(cfg) => return Self::with_config(cfg),
                Err(err) => {
                    tracing::warn!(target: "policy", %path, "failed to load policy file: {err}");
                }
            }
        }
        if std::env::var("FOIL_POLICY_ALLOW_ALL").ok().as_deref() == Some("1") {
            return Self::with_config(PolicyConfig {
                allow_all: true,
                rules: vec![],
            });
        }
        Self::with_config(PolicyConfig::default())
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    pub fn validate(&self, view: &ProposalView, _context: &Value) -> Verdict {
        if self.cfg.allow_all {
            return Verdict::clean();
        }
        let mut violations = Vec::new();
        for rule in &self.cfg.rules {
            match rule {
                PolicyRule::MaxFee { limit } => {
                    if let Some(fee) = view.fee_amount {
                        if fee > *limit {
                            violations.push(format!("fee {fee:.2} exceeds limit {limit:.2}"));
                        }
                    }
                }
                PolicyRule::RiskFlag { flags } => {
                    for flag in &view.risk_flags {
                        if flags.contains(flag) {
                            violations.push(format!("risk flag: {flag}"));
                        }
                    }
                }
                PolicyRule::DenyAction { action_types } => {
                    if action_types.contains(&view.action_type) {
                        violations.push(format!("action type denied: {}", view.action_type));
                    }
                }
                PolicyRule::MinConfidence { floor } => {
                    if view.confidence < *floor {
                        violations
                            .push(format!("confidence {:.2} below {floor:.2}", view.confidence));
                    }
                }
            }
        }
        Verdict {
            blocked: !violations.is_empty(),
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view(action: &str, confidence: f64, fee: Option<f64>, flags: &[&str]) -> ProposalView {
        ProposalView {
            case_id: "c1".into(),
            action_type: action.into(),
            confidence,
            risk_flags: flags.iter().map(|s| s.to_string()).collect(),
            fee_amount: fee,
            autopilot_mode: "auto".into(),
        }
    }

    #[test]
    fn defaults_block_large_fees() {
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let verdict = engine.validate(&view("send_followup", 0.9, Some(250.0), &[]), &json!({}));
        assert!(verdict.blocked);
        assert_eq!(verdict.violations.len(), 1);
    }

    #[test]
    fn defaults_block_flagged_risk() {
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let verdict = engine.validate(
            &view("send_followup", 0.9, None, &["legal_threat"]),
            &json!({}),
        );
        assert!(verdict.blocked);
    }

    #[test]
    fn allow_all_short_circuits() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            allow_all: true,
            rules: vec![PolicyRule::MinConfidence { floor: 1.0 }],
        });
        let verdict = engine.validate(&view("send_appeal", 0.1, Some(1e6), &[]), &json!({}));
        assert!(!verdict.blocked);
    }

    #[test]
    fn deny_action_rule_names_the_type() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            allow_all: false,
            rules: vec![PolicyRule::DenyAction {
                action_types: vec!["file_appeal".into()],
            }],
        });
        let verdict = engine.validate(&view("file_appeal", 0.95, None, &[]), &json!({}));
        assert!(verdict.blocked);
        assert!(verdict.violations[0].contains("file_appeal"));
    }
}
