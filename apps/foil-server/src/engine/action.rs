/// Outbound action kinds a proposal can carry. Each maps to a delivery
/// capability and a small behavior table the planner and executor consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    SendRequest,
    SendFollowup,
    SendClarification,
    SendAppeal,
    PayFee,
    PortalSubmit,
}

#[derive(Debug, Clone, Copy)]
pub struct ActionBehavior {
    /// Repeat proposals of this type against the same case reuse the open
    /// one; an unguarded collision is surfaced as an error instead.
    pub loop_guarded: bool,
    /// Job kind submitted to deliver the side effect.
    pub delivery_kind: &'static str,
}

impl ActionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send_request" => Some(Self::SendRequest),
            "send_followup" => Some(Self::SendFollowup),
            "send_clarification" => Some(Self::SendClarification),
            "send_appeal" => Some(Self::SendAppeal),
            "pay_fee" => Some(Self::PayFee),
            "portal_submit" => Some(Self::PortalSubmit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendRequest => "send_request",
            Self::SendFollowup => "send_followup",
            Self::SendClarification => "send_clarification",
            Self::SendAppeal => "send_appeal",
            Self::PayFee => "pay_fee",
            Self::PortalSubmit => "portal_submit",
        }
    }

    pub fn behavior(&self) -> ActionBehavior {
        match self {
            Self::SendRequest => ActionBehavior {
                loop_guarded: false,
                delivery_kind: "email.send",
            },
            Self::SendFollowup => ActionBehavior {
                loop_guarded: true,
                delivery_kind: "email.send",
            },
            Self::SendClarification => ActionBehavior {
                loop_guarded: true,
                delivery_kind: "email.send",
            },
            Self::SendAppeal => ActionBehavior {
                loop_guarded: false,
                delivery_kind: "email.send",
            },
            Self::PayFee => ActionBehavior {
                loop_guarded: true,
                delivery_kind: "portal.sync",
            },
            Self::PortalSubmit => ActionBehavior {
                loop_guarded: false,
                delivery_kind: "portal.sync",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_round_trip() {
        for a in [
            ActionType::SendRequest,
            ActionType::SendFollowup,
            ActionType::SendClarification,
            ActionType::SendAppeal,
            ActionType::PayFee,
            ActionType::PortalSubmit,
        ] {
            assert_eq!(ActionType::parse(a.as_str()), Some(a));
        }
        assert!(ActionType::parse("does_not_exist").is_none());
    }

    #[test]
    fn followups_are_loop_guarded() {
        assert!(ActionType::SendFollowup.behavior().loop_guarded);
        assert!(!ActionType::SendRequest.behavior().loop_guarded);
    }
}
