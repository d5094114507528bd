// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Tests critical boundary conditions in:
//! - Status merge ordering (PAY-M01 to PAY-M05)
//! - Subscription state machine sequences (SUB-S01 to SUB-S06)
//! - Webhook dedup keys (HOOK-D01 to HOOK-D03)

#[cfg(test)]
mod status_merge_tests {
    use crate::payments::{merge_decision, MergeDecision, ProviderStatus};

    /// Replay a sequence of provider statuses against an empty ledger row
    /// the way the processor does: apply only when merge_decision says so.
    fn replay(sequence: &[ProviderStatus]) -> Option<&'static str> {
        let mut current: Option<&'static str> = None;
        for &status in sequence {
            if merge_decision(current, status) == MergeDecision::Apply {
                current = Some(status.as_str());
            }
        }
        current
    }

    fn permutations(items: &[ProviderStatus]) -> Vec<Vec<ProviderStatus>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, &head) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    // =========================================================================
    // PAY-M01: Every permutation of a status set converges to the most
    // terminal member, regardless of delivery order
    // =========================================================================
    #[test]
    fn test_convergence_under_any_permutation() {
        let statuses = [
            ProviderStatus::Pending,
            ProviderStatus::Approved,
            ProviderStatus::Refunded,
        ];
        for perm in permutations(&statuses) {
            assert_eq!(
                replay(&perm),
                Some("refunded"),
                "order {:?} did not converge to refunded",
                perm
            );
        }

        let statuses = [
            ProviderStatus::Pending,
            ProviderStatus::InProcess,
            ProviderStatus::Approved,
            ProviderStatus::Cancelled,
        ];
        for perm in permutations(&statuses) {
            assert_eq!(replay(&perm), Some("cancelled"));
        }
    }

    // =========================================================================
    // PAY-M02: Replaying the same sequence twice is a no-op the second time
    // =========================================================================
    #[test]
    fn test_replay_is_idempotent() {
        let sequence = [
            ProviderStatus::Pending,
            ProviderStatus::Approved,
            ProviderStatus::Refunded,
        ];
        let once = replay(&sequence);
        let twice = replay(&[&sequence[..], &sequence[..]].concat());
        assert_eq!(once, twice);
    }

    // =========================================================================
    // PAY-M03: Refund arriving before the delayed approval wins (spec §8
    // example scenario)
    // =========================================================================
    #[test]
    fn test_refund_before_delayed_approval() {
        assert_eq!(
            replay(&[ProviderStatus::Refunded, ProviderStatus::Approved]),
            Some("refunded")
        );
    }

    // =========================================================================
    // PAY-M04: Equal-rank flip (approved vs rejected) trusts the later event
    // =========================================================================
    #[test]
    fn test_equal_rank_applies_latest() {
        assert_eq!(
            replay(&[ProviderStatus::Approved, ProviderStatus::Rejected]),
            Some("rejected")
        );
        assert_eq!(
            replay(&[ProviderStatus::Rejected, ProviderStatus::Approved]),
            Some("approved")
        );
    }

    // =========================================================================
    // PAY-M05: Chargeback behaves like a refund for ordering purposes
    // =========================================================================
    #[test]
    fn test_chargeback_is_most_terminal() {
        assert_eq!(
            replay(&[
                ProviderStatus::ChargedBack,
                ProviderStatus::Cancelled,
                ProviderStatus::Approved,
            ]),
            Some("charged_back")
        );
    }
}

#[cfg(test)]
mod subscription_sequence_tests {
    use crate::payments::{merge_decision, MergeDecision, ProviderStatus};
    use crate::subscriptions::{transition, SubscriptionSignal, SubscriptionState};
    use time::OffsetDateTime;
    use vitrina_shared::{Plan, PlanStatus};

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    /// Pure mirror of the processor pipeline for one payment: ledger merge
    /// gates which statuses reach the subscription state machine.
    fn drive(plan: Plan, sequence: &[ProviderStatus]) -> SubscriptionState {
        let mut mp_status: Option<&'static str> = None;
        let mut business = SubscriptionState::free();

        for &status in sequence {
            if merge_decision(mp_status, status) != MergeDecision::Apply {
                continue;
            }
            mp_status = Some(status.as_str());

            if !status.is_terminal() {
                continue;
            }
            let signal = match status {
                ProviderStatus::Approved => SubscriptionSignal::PaymentApproved { plan, at: now() },
                ProviderStatus::Rejected | ProviderStatus::Cancelled => {
                    SubscriptionSignal::PaymentFailed
                }
                _ => SubscriptionSignal::PaymentRefunded,
            };
            if let Some(next) = transition(business, signal) {
                business = next;
            }
        }
        business
    }

    // =========================================================================
    // SUB-S01: Approved delivered twice -> single activation (spec §8 example)
    // =========================================================================
    #[test]
    fn test_double_approval_single_activation() {
        let state = drive(
            Plan::Premium,
            &[ProviderStatus::Approved, ProviderStatus::Approved],
        );
        assert_eq!(state.plan, Plan::Premium);
        assert_eq!(state.status, PlanStatus::Active);
        assert!(state.expires_at.is_some());
    }

    // =========================================================================
    // SUB-S02: Refund then delayed duplicate approval -> INACTIVE wins
    // (spec §8 example)
    // =========================================================================
    #[test]
    fn test_refund_wins_over_delayed_approval() {
        let state = drive(
            Plan::Premium,
            &[
                ProviderStatus::Approved,
                ProviderStatus::Refunded,
                ProviderStatus::Approved,
            ],
        );
        assert_eq!(state.status, PlanStatus::Inactive);
    }

    // =========================================================================
    // SUB-S03: Refund arriving before approval still ends INACTIVE
    // =========================================================================
    #[test]
    fn test_refund_first_then_approval() {
        let state = drive(
            Plan::Premium,
            &[ProviderStatus::Refunded, ProviderStatus::Approved],
        );
        // The approval is stale (lower rank) and never reaches the machine,
        // but the refund on a still-free business is also a no-op: the net
        // is no entitlement, which is the safe side.
        assert_eq!(state.plan, Plan::Free);
    }

    // =========================================================================
    // SUB-S04: Rejected first purchase leaves the business free
    // =========================================================================
    #[test]
    fn test_rejected_first_purchase_stays_free() {
        let state = drive(
            Plan::Basic,
            &[ProviderStatus::Pending, ProviderStatus::Rejected],
        );
        assert_eq!(state.plan, Plan::Free);
        assert_eq!(state.status, PlanStatus::Active);
    }

    // =========================================================================
    // SUB-S05: Pending-only sequences never touch the subscription
    // =========================================================================
    #[test]
    fn test_pending_sequences_have_no_effect() {
        let state = drive(
            Plan::Premium,
            &[ProviderStatus::Pending, ProviderStatus::InProcess],
        );
        assert_eq!(state, SubscriptionState::free());
    }

    // =========================================================================
    // SUB-S06: Cancellation keeps the plan, refund after cancellation
    // deactivates
    // =========================================================================
    #[test]
    fn test_cancellation_then_refund() {
        let mut business = SubscriptionState::free();
        business = transition(
            business,
            SubscriptionSignal::PaymentApproved {
                plan: Plan::Basic,
                at: now(),
            },
        )
        .unwrap();

        business = transition(business, SubscriptionSignal::Cancellation).unwrap();
        assert_eq!(business.plan, Plan::Basic);
        assert_eq!(business.status, PlanStatus::Cancelled);

        business = transition(business, SubscriptionSignal::PaymentRefunded).unwrap();
        assert_eq!(business.status, PlanStatus::Inactive);
    }
}

#[cfg(test)]
mod dedup_key_tests {
    use crate::sweep::synthetic_request_id;
    use crate::webhooks::WebhookHandler;

    // =========================================================================
    // HOOK-D01: Body-hash fallback keys collide exactly when bodies match
    // =========================================================================
    #[test]
    fn test_body_hash_fallback_collision_semantics() {
        let body = r#"{"type":"payment","data":{"id":42}}"#;
        assert_eq!(
            WebhookHandler::derived_request_id(body),
            WebhookHandler::derived_request_id(body)
        );
        assert_ne!(
            WebhookHandler::derived_request_id(body),
            WebhookHandler::derived_request_id(r#"{"type":"payment","data":{"id":43}}"#)
        );
    }

    // =========================================================================
    // HOOK-D02: Synthetic poll keys never collide with provider request ids
    // =========================================================================
    #[test]
    fn test_synthetic_keys_are_namespaced() {
        let synthetic = synthetic_request_id("42", "approved");
        assert!(synthetic.starts_with("poll:"));
        assert!(!WebhookHandler::derived_request_id("body").starts_with("poll:"));
    }

    // =========================================================================
    // HOOK-D03: A poll that observes a new status produces a new key
    // =========================================================================
    #[test]
    fn test_poll_key_changes_with_status() {
        assert_ne!(
            synthetic_request_id("42", "pending"),
            synthetic_request_id("42", "approved")
        );
    }
}
