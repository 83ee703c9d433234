#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use crate::derive::derive_connection_keys;
    use crate::seed::WalletSeed;

    proptest! {
        #[test]
        fn test_derivation_determinism(seed in any::<[u8; 32]>(), index in any::<u64>()) {
            let a = derive_connection_keys(&WalletSeed::from_bytes(seed), index).unwrap();
            let b = derive_connection_keys(&WalletSeed::from_bytes(seed), index).unwrap();
            prop_assert_eq!(a.identity_pub(), b.identity_pub());
            prop_assert_eq!(a.derived_pub(), b.derived_pub());
        }

        #[test]
        fn test_neighbouring_indices_differ(seed in any::<[u8; 32]>(), index in 0u64..u64::MAX) {
            let s = WalletSeed::from_bytes(seed);
            let a = derive_connection_keys(&s, index).unwrap();
            let b = derive_connection_keys(&s, index + 1).unwrap();
            prop_assert_ne!(a.identity_pub(), b.identity_pub());
        }
    }
}
