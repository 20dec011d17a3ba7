use proptest::prelude::*;
use rust_decimal::Decimal;

use storefront_api::services::orders::discount_amount;
use storefront_api::services::payments::{constant_time_eq, verification_signature};

proptest! {
    /// The discount never exceeds the pre-discount total and never goes
    /// negative, for any percent in [0, 100] and any sane cart total.
    #[test]
    fn discount_stays_within_bounds(total_cents in 0i64..=100_000_000, percent in 0u32..=100) {
        let total = Decimal::new(total_cents, 2);
        let percent = Decimal::from(percent);

        let saved = discount_amount(total, percent);
        prop_assert!(saved >= Decimal::ZERO);
        prop_assert!(saved <= total);
        prop_assert!(total - saved >= Decimal::ZERO);
    }

    /// A 100% discount saves the whole (rounded) total; 0% saves nothing.
    #[test]
    fn discount_edges_are_exact(total_cents in 0i64..=100_000_000) {
        let total = Decimal::new(total_cents, 2);
        prop_assert_eq!(discount_amount(total, Decimal::ZERO), Decimal::ZERO);
        prop_assert_eq!(discount_amount(total, Decimal::from(100)), total);
    }

    /// The verification signature is deterministic in its inputs and changes
    /// whenever any input changes.
    #[test]
    fn signature_is_deterministic_and_input_sensitive(
        order in "[a-z0-9]{1,24}",
        payment in "[a-z0-9]{1,24}",
        secret in "[a-zA-Z0-9]{8,32}",
    ) {
        let sig = verification_signature(&secret, &order, &payment);
        prop_assert_eq!(sig.clone(), verification_signature(&secret, &order, &payment));
        prop_assert!(constant_time_eq(&sig, &sig));

        let other_payment = format!("{}x", payment);
        prop_assert!(!constant_time_eq(&sig, &verification_signature(&secret, &order, &other_payment)));
    }
}
