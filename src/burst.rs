//! Jumbo 突发策略
//! 决定一次选键是否附带大量额外条目，以压测宽分区

use crate::config::JumboConfig;
use crate::error::{AppError, Result};
use crate::keys::SelectedKey;
use rand::Rng;
use rand::seq::IndexedRandom;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstPolicy {
    frequency: i64,
    initial_exclude: u64,
    sizes: Vec<usize>,
}

impl BurstPolicy {
    pub fn new(jumbo: &JumboConfig) -> Result<Self> {
        if jumbo.frequency < 1 {
            return Err(AppError::Config(format!(
                "jumbo frequency must be at least 1, got {}",
                jumbo.frequency
            )));
        }
        if jumbo.sizes.is_empty() {
            return Err(AppError::Config("jumbo size menu is empty".into()));
        }
        Ok(Self {
            frequency: jumbo.frequency,
            initial_exclude: jumbo.initial_exclude,
            sizes: jumbo.sizes.clone(),
        })
    }

    /// 原始索引超过排除下限，且变换后索引是频率的整数倍
    #[inline]
    pub fn is_jumbo(&self, raw: u64, transformed: i64) -> bool {
        raw > self.initial_exclude && transformed.rem_euclid(self.frequency) == 0
    }

    /// 从大小菜单中均匀选取额外条目数，菜单在构造时保证非空
    pub fn extra_count<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.sizes.choose(rng).copied().unwrap_or_default()
    }

    /// 触发时返回额外条目数
    pub fn decide<R: Rng + ?Sized>(&self, key: &SelectedKey, rng: &mut R) -> Option<usize> {
        self.is_jumbo(key.raw, key.transformed)
            .then(|| self.extra_count(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use test_case::test_case;

    fn policy() -> BurstPolicy {
        BurstPolicy::new(&JumboConfig {
            frequency: 50,
            initial_exclude: 100,
            sizes: vec![25, 25, 50, 100, 1000],
        })
        .unwrap()
    }

    #[test_case(0, vec![25]; "zero frequency")]
    #[test_case(-50, vec![25]; "negative frequency")]
    #[test_case(50, vec![]; "empty menu")]
    fn unusable_jumbo_config_is_rejected(frequency: i64, sizes: Vec<usize>) {
        let jumbo = JumboConfig {
            frequency,
            initial_exclude: 100,
            sizes,
        };
        assert!(BurstPolicy::new(&jumbo).unwrap_err().is_config());
    }

    #[test_case(150, 150, true; "multiple above floor")]
    #[test_case(149, 149, false; "not a multiple")]
    #[test_case(100, 100, false; "at the floor")]
    #[test_case(50, 50, false; "below the floor")]
    #[test_case(200, -200, true; "negative transformed")]
    #[test_case(101, 150, true; "offset moved onto a multiple")]
    fn jumbo_rule(raw: u64, transformed: i64, expected: bool) {
        assert_eq!(policy().is_jumbo(raw, transformed), expected);
    }

    #[test]
    fn floor_excludes_every_low_index() {
        let policy = policy();
        for raw in 0..=100u64 {
            assert!(!policy.is_jumbo(raw, 0));
        }
    }

    #[test]
    fn extra_counts_come_from_the_menu() {
        let policy = policy();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..500 {
            let n = policy.extra_count(&mut rng);
            assert!([25, 50, 100, 1000].contains(&n));
            seen.insert(n);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn decide_only_draws_when_triggered() {
        let policy = policy();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let cold = SelectedKey {
            raw: 3,
            transformed: 3,
            name: "rloc:3".into(),
        };
        assert_eq!(policy.decide(&cold, &mut rng), None);
        let hot = SelectedKey {
            raw: 250,
            transformed: 250,
            name: "rloc:250".into(),
        };
        assert!(policy.decide(&hot, &mut rng).is_some());
    }
}
