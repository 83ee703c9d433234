#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::config::PoolConfig;
    use crate::harness::TestWallet;
    use crate::retry::{retry, Failure, RetryPolicy};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_reservations_never_overlap(
            sizes in proptest::collection::vec(0usize..12, 1..10),
            target in 1usize..16,
            low in 0usize..16,
        ) {
            let config = PoolConfig {
                target_size: target,
                low_water_mark: low.min(target),
                generator_workers: 3,
            };
            let all = runtime().block_on(async {
                let wallet = TestWallet::with_config(config);
                let pool = wallet.allocator();
                let mut all = Vec::new();
                for n in &sizes {
                    let pairs = pool.reserve(*n).await.unwrap();
                    assert_eq!(pairs.len(), *n);
                    all.push(pairs.iter().map(|p| p.connection_index).collect::<Vec<_>>());
                }
                all
            });

            for batch in &all {
                prop_assert!(batch.windows(2).all(|w| w[0] < w[1]));
            }
            let mut flat: Vec<u64> = all.into_iter().flatten().collect();
            let total = flat.len();
            flat.sort_unstable();
            flat.dedup();
            prop_assert_eq!(flat.len(), total);
        }

        #[test]
        fn test_retry_attempt_count(retries in 0u32..6, bail_at in proptest::option::of(1u32..8)) {
            let policy = RetryPolicy {
                retries,
                min_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
                factor: 2.0,
            };
            let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
            let counter = attempts.clone();
            let result: Result<(), u32> = runtime().block_on(retry(&policy, move |attempt| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if Some(attempt) == bail_at {
                        Err(Failure::Bail(attempt))
                    } else {
                        Err(Failure::Retry(attempt))
                    }
                }
            }));

            let expected = match bail_at {
                Some(b) if b <= retries + 1 => b,
                _ => retries + 1,
            };
            prop_assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), expected);
            prop_assert_eq!(result, Err(expected));
        }
    }
}
