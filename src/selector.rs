//! Chooses which permit funds a metered call.
//!
//! Preference order: a permit matching the agent's payout token *and* chain
//! settles same-chain with a single transfer; failing that, USDC is preferred
//! because only USDC can cross chains; failing that, any permit with enough
//! remaining value (the transfer engine will reject impossible routes).
//! Within a tier the largest remaining value wins, newest first on ties.

use rust_decimal::Decimal;

use crate::types::{Agent, Permit};

fn best<'a>(permits: impl Iterator<Item = &'a Permit>) -> Option<&'a Permit> {
    permits.max_by(|a, b| {
        a.remaining_value()
            .cmp(&b.remaining_value())
            .then(a.created_at.cmp(&b.created_at))
    })
}

/// Pick the best permit to fund a call costing `cost` USD, or `None` when no
/// permit qualifies.
///
/// A permit qualifies when it is active, unexpired, and its remaining value
/// covers the cost (inclusive: remaining exactly equal to cost passes).
pub fn select_permit<'a>(
    permits: &'a [Permit],
    agent: &Agent,
    cost: Decimal,
    now_millis: u64,
) -> Option<&'a Permit> {
    let eligible: Vec<&Permit> = permits
        .iter()
        .filter(|p| p.is_usable(now_millis) && p.remaining_value() >= cost)
        .collect();

    let preferences = &agent.payment_preferences;
    let preferred = best(eligible.iter().copied().filter(|p| {
        p.token == preferences.payout_token && p.chain_id == preferences.payout_chain_id
    }));
    if preferred.is_some() {
        return preferred;
    }

    let usdc = best(eligible.iter().copied().filter(|p| p.token.is_usdc()));
    if usdc.is_some() {
        return usdc;
    }

    best(eligible.into_iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TokenSymbol;
    use crate::types::{PaymentPreferences, PermitStatus, new_id, test_permit};
    use alloy_primitives::Address;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use url::Url;

    fn test_agent() -> Agent {
        Agent {
            id: "agent_1".to_string(),
            name: "echo".to_string(),
            price_per_call_usd: Decimal::from_str("0.10").unwrap(),
            payment_preferences: PaymentPreferences {
                payout_token: TokenSymbol::usdc(),
                payout_chain_id: 84532,
            },
            publisher_wallet_address: Address::repeat_byte(0xbb),
            api_endpoint: Url::parse("https://publisher.example/api").unwrap(),
            publisher_api_key: "pk_test".to_string(),
            free_trial_tries: 0,
        }
    }

    fn cost() -> Decimal {
        Decimal::from_str("0.10").unwrap()
    }

    #[test]
    fn prefers_matching_token_and_chain() {
        let mut matching = test_permit();
        matching.id = new_id("permit");
        let mut bigger_elsewhere = test_permit();
        bigger_elsewhere.chain_id = 11155111;
        bigger_elsewhere.max_calls = 1000;

        let permits = vec![bigger_elsewhere, matching.clone()];
        let selected = select_permit(&permits, &test_agent(), cost(), 0).unwrap();
        assert_eq!(selected.id, matching.id);
    }

    #[test]
    fn falls_back_to_usdc_on_other_chain() {
        let mut usdc_elsewhere = test_permit();
        usdc_elsewhere.chain_id = 11155111;
        let mut pyusd_matching_chain = test_permit();
        pyusd_matching_chain.token = TokenSymbol::new("PYUSD");
        pyusd_matching_chain.max_calls = 1000;

        let permits = vec![pyusd_matching_chain, usdc_elsewhere.clone()];
        let selected = select_permit(&permits, &test_agent(), cost(), 0).unwrap();
        assert_eq!(selected.id, usdc_elsewhere.id);
    }

    #[test]
    fn any_token_as_last_resort() {
        let mut pyusd = test_permit();
        pyusd.token = TokenSymbol::new("PYUSD");
        pyusd.chain_id = 1;

        let permits = vec![pyusd.clone()];
        let selected = select_permit(&permits, &test_agent(), cost(), 0).unwrap();
        assert_eq!(selected.id, pyusd.id);
    }

    #[test]
    fn largest_remaining_value_wins_within_tier() {
        let mut small = test_permit();
        small.calls_used = 90;
        let mut large = test_permit();
        large.calls_used = 10;

        let permits = vec![small, large.clone()];
        let selected = select_permit(&permits, &test_agent(), cost(), 0).unwrap();
        assert_eq!(selected.id, large.id);
    }

    #[test]
    fn ties_break_to_newest() {
        let mut older = test_permit();
        older.created_at = 100;
        let mut newer = test_permit();
        newer.created_at = 200;

        let permits = vec![older, newer.clone()];
        let selected = select_permit(&permits, &test_agent(), cost(), 0).unwrap();
        assert_eq!(selected.id, newer.id);
    }

    #[test]
    fn exact_remaining_value_is_eligible() {
        let mut exact = test_permit();
        exact.calls_used = 99; // 0.10 remaining, cost 0.10

        let permits = vec![exact.clone()];
        let selected = select_permit(&permits, &test_agent(), cost(), 0).unwrap();
        assert_eq!(selected.id, exact.id);
    }

    #[test]
    fn exhausted_expired_and_revoked_are_ineligible() {
        let mut exhausted = test_permit();
        exhausted.calls_used = exhausted.max_calls;
        let mut expired = test_permit();
        expired.expires_at = 10;
        let mut revoked = test_permit();
        revoked.status = PermitStatus::Revoked;

        let permits = vec![exhausted, expired, revoked];
        assert!(select_permit(&permits, &test_agent(), cost(), 1_000).is_none());
    }

    #[test]
    fn insufficient_remaining_value_is_ineligible() {
        let permits = vec![test_permit()];
        let expensive = Decimal::from_str("10.01").unwrap();
        assert!(select_permit(&permits, &test_agent(), expensive, 0).is_none());
    }
}
