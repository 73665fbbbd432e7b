//! Time-window selector tests without an active region.
//!
//! Coverage:
//! - Empty blocklists
//! - Smallest blocks of a window are grouped first, ties by block ID
//! - Oldest window first, windows never mix
//! - Object ceiling and group size bounds
//! - Group hashes
//! - Config validation and defaults

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::compaction::tests::helpers::*;
    use crate::compaction::{
        CompactionBlockSelector, CompactionError, SelectorConfig, TimeWindowBlockSelector,
    };

    #[test]
    fn empty_blocklist_yields_nothing() {
        let mut selector = TimeWindowBlockSelector::new(&[], plain_config()).unwrap();
        assert!(selector.blocks_to_compact().is_none());
        assert!(selector.blocks_to_compact().is_none());
    }

    #[test]
    fn two_blocks_in_one_window() {
        let blocks = vec![meta(0, SECOND, 0, 0), meta(1, SECOND, 0, 0)];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();

        let group = selector.blocks_to_compact().unwrap();
        assert_eq!(numbers(&group), vec![0, 1]);
        assert_eq!(group.hash, "tenant-*-1");
        assert!(selector.blocks_to_compact().is_none());
    }

    #[test]
    fn smallest_two_of_three_are_chosen() {
        let blocks = vec![
            meta(0, SECOND, 1, 0),
            meta(1, SECOND, 0, 0),
            meta(2, SECOND, 0, 0),
        ];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();
        assert_eq!(drain(&mut selector), vec![vec![1, 2]]);
    }

    #[test]
    fn lone_block_in_a_window_is_left_alone() {
        let blocks = vec![
            meta(0, SECOND, 1, 0),
            meta(1, SECOND, 0, 0),
            meta(2, 2 * SECOND, 0, 0),
        ];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();

        let group = selector.blocks_to_compact().unwrap();
        assert_eq!(numbers(&group), vec![1, 0]);
        assert_eq!(group.blocks[0].end_time, SECOND);
        assert!(selector.blocks_to_compact().is_none());
    }

    #[test]
    fn one_window_is_drained_in_size_order() {
        let blocks = vec![
            meta(0, SECOND, 2, 0),
            meta(1, SECOND, 0, 0),
            meta(2, SECOND, 1, 0),
            meta(3, SECOND, 3, 0),
        ];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();
        assert_eq!(drain(&mut selector), vec![vec![1, 2], vec![0, 3]]);
    }

    #[test]
    fn windows_are_taken_oldest_first_and_never_mixed() {
        let blocks = vec![
            meta(0, SECOND, 1, 0),
            meta(1, 3 * SECOND, 0, 0),
            meta(2, SECOND, 0, 0),
            meta(3, 3 * SECOND, 1, 0),
            meta(4, 3 * SECOND, 2, 0),
            meta(5, SECOND, 2, 0),
        ];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();

        let first = selector.blocks_to_compact().unwrap();
        assert_eq!(numbers(&first), vec![2, 0]);
        assert!(first.blocks.iter().all(|m| m.end_time == SECOND));

        let second = selector.blocks_to_compact().unwrap();
        assert_eq!(numbers(&second), vec![1, 3]);
        assert!(second.blocks.iter().all(|m| m.end_time == 3 * SECOND));
        assert_eq!(second.hash, "tenant-*-3");

        // blocks 5 and 4 are each the last of their window
        assert!(selector.blocks_to_compact().is_none());
    }

    #[test]
    fn levels_mix_outside_the_active_region() {
        let blocks = vec![meta(0, SECOND, 5, 0), meta(1, SECOND, 5, 3)];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();
        assert_eq!(drain(&mut selector), vec![vec![0, 1]]);
    }

    #[test]
    fn object_ceiling_limits_groups() {
        // 50 + 60 exceeds the ceiling of 100, so no pair fits
        let blocks = vec![
            meta(0, SECOND, 60, 0),
            meta(1, SECOND, 50, 0),
            meta(2, SECOND, 70, 0),
        ];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();
        assert!(selector.blocks_to_compact().is_none());

        // the full window is skipped, the next one is still considered
        let blocks = vec![
            meta(0, SECOND, 60, 0),
            meta(1, SECOND, 50, 0),
            meta(2, 2 * SECOND, 40, 0),
            meta(3, 2 * SECOND, 60, 0),
        ];
        let mut selector = TimeWindowBlockSelector::new(&blocks, plain_config()).unwrap();
        assert_eq!(drain(&mut selector), vec![vec![2, 3]]);
    }

    #[test]
    fn group_size_follows_input_bounds() {
        let config = SelectorConfig {
            min_input_blocks: 2,
            max_input_blocks: 3,
            ..plain_config()
        };
        let blocks: Vec<_> = (0..5).map(|n| meta(n, SECOND, 1, 0)).collect();
        let mut selector = TimeWindowBlockSelector::new(&blocks, config).unwrap();
        assert_eq!(drain(&mut selector), vec![vec![0, 1, 2], vec![3, 4]]);

        let config = SelectorConfig {
            min_input_blocks: 3,
            max_input_blocks: 3,
            ..plain_config()
        };
        let blocks: Vec<_> = (0..2).map(|n| meta(n, SECOND, 1, 0)).collect();
        let mut selector = TimeWindowBlockSelector::new(&blocks, config).unwrap();
        assert!(selector.blocks_to_compact().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cases = [
            SelectorConfig {
                max_compaction_range: Duration::ZERO,
                ..plain_config()
            },
            SelectorConfig {
                max_compaction_objects: 0,
                ..plain_config()
            },
            SelectorConfig {
                min_input_blocks: 1,
                ..plain_config()
            },
            SelectorConfig {
                min_input_blocks: 4,
                max_input_blocks: 3,
                ..plain_config()
            },
        ];
        for config in cases {
            assert!(matches!(
                TimeWindowBlockSelector::new(&[], config),
                Err(CompactionError::InvalidConfig(_))
            ));
        }
        assert!(SelectorConfig::default().validate().is_ok());
    }

    #[test]
    fn default_config_uses_plain_time_windows() {
        const HOUR: u64 = 60 * 60 * SECOND;
        let now = 10 * DAY;
        let blocks = vec![meta(0, now - SECOND, 5, 0), meta(1, now - SECOND, 3, 1)];

        let config = SelectorConfig::default();
        assert_eq!(config.active_window, None);
        assert_eq!(config.max_compaction_range, Duration::from_secs(60 * 60));

        // levels mix even in the window that is still receiving data
        let mut selector = TimeWindowBlockSelector::new_at(&blocks, config, now).unwrap();
        let group = selector.blocks_to_compact().unwrap();
        assert_eq!(numbers(&group), vec![1, 0]);
        assert_eq!(group.hash, format!("tenant-*-{}", (now - SECOND) / HOUR));
        assert!(selector.blocks_to_compact().is_none());
    }
}
